//! Network reachability of a firewall's SSH endpoint
//!
//! The steady-state design is a standing allow rule for the manager, installed
//! out of band, so granting is a read-only reachability check. The older design
//! adds a time-boxed rule per session through the grant request queue and
//! removes it again on reclaim; it remains available as a strategy and as a
//! fallback.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use tunnelgate_db::entities::grant_request::{GrantAction, GrantStatus};
use tunnelgate_db::{GrantQueue, TunnelSession};

use crate::config::{GrantConfig, GrantStrategy};
use crate::error::TunnelError;
use crate::registry::FirewallEndpoint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "grant", rename_all = "snake_case")]
pub enum GrantResult {
    /// Reachable through the standing rule; nothing to undo
    Standing,
    /// A per-session rule was added and must be removed on reclaim
    RuleAdded { label: String },
}

impl GrantResult {
    pub fn rule_label(&self) -> Option<&str> {
        match self {
            GrantResult::Standing => None,
            GrantResult::RuleAdded { label } => Some(label),
        }
    }
}

#[async_trait]
pub trait AccessGrant: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ensure(
        &self,
        endpoint: &FirewallEndpoint,
        session: &TunnelSession,
    ) -> Result<GrantResult, TunnelError>;

    /// Undo a grant identified by its rule label
    async fn revoke(&self, target: &str, label: &str) -> Result<(), TunnelError>;
}

/// Verifies the standing rule by connecting to the SSH port
#[derive(Debug, Clone)]
pub struct PermanentGrant {
    timeout: Duration,
}

impl PermanentGrant {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl AccessGrant for PermanentGrant {
    fn name(&self) -> &'static str {
        "permanent"
    }

    async fn ensure(
        &self,
        endpoint: &FirewallEndpoint,
        _session: &TunnelSession,
    ) -> Result<GrantResult, TunnelError> {
        let address = (endpoint.hostname.as_str(), endpoint.ssh_port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                debug!(
                    "{}:{} reachable through standing rule",
                    endpoint.hostname, endpoint.ssh_port
                );
                Ok(GrantResult::Standing)
            }
            Ok(Err(e)) => Err(TunnelError::AccessGrantFailure(format!(
                "{}:{} unreachable: {}",
                endpoint.hostname, endpoint.ssh_port, e
            ))),
            Err(_) => Err(TunnelError::AccessGrantFailure(format!(
                "{}:{} did not answer within {:?}",
                endpoint.hostname, endpoint.ssh_port, self.timeout
            ))),
        }
    }

    async fn revoke(&self, _target: &str, _label: &str) -> Result<(), TunnelError> {
        Ok(())
    }
}

/// Label carrying the rule's expiry so the firewall agent can drop it on its own
pub fn rule_label(session: &TunnelSession) -> String {
    format!(
        "tunnelgate-{}-exp-{}",
        session.id,
        session.expires_at.timestamp()
    )
}

/// Adds a per-session rule through the grant request queue and waits for the agent
#[derive(Debug, Clone)]
pub struct EphemeralRuleGrant {
    queue: GrantQueue,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl EphemeralRuleGrant {
    pub fn new(queue: GrantQueue, poll_attempts: u32, poll_interval: Duration) -> Self {
        Self {
            queue,
            poll_attempts,
            poll_interval,
        }
    }
}

#[async_trait]
impl AccessGrant for EphemeralRuleGrant {
    fn name(&self) -> &'static str {
        "ephemeral"
    }

    async fn ensure(
        &self,
        endpoint: &FirewallEndpoint,
        session: &TunnelSession,
    ) -> Result<GrantResult, TunnelError> {
        if let Some(label) = &session.rule_label {
            debug!("Session {} already has rule {}", session.id, label);
            return Ok(GrantResult::RuleAdded {
                label: label.clone(),
            });
        }

        let label = rule_label(session);
        let request = self
            .queue
            .enqueue(&endpoint.id, GrantAction::AddRule, &label, Utc::now())
            .await?;

        for _ in 0..self.poll_attempts {
            tokio::time::sleep(self.poll_interval).await;

            let Some(current) = self.queue.get(&request.id).await? else {
                break;
            };
            match current.status {
                GrantStatus::Pending => continue,
                GrantStatus::Completed => {
                    info!("Rule {} active on {}", label, endpoint.id);
                    return Ok(GrantResult::RuleAdded { label });
                }
                GrantStatus::Failed => {
                    return Err(TunnelError::AccessGrantFailure(format!(
                        "{} rejected rule {}: {}",
                        endpoint.id,
                        label,
                        current.error.unwrap_or_default()
                    )));
                }
            }
        }

        // The agent may still apply it later; queue the removal so it does not linger
        if let Err(e) = self.revoke(&endpoint.id, &label).await {
            warn!("Failed to queue removal of unconfirmed rule {}: {}", label, e);
        }
        Err(TunnelError::AccessGrantFailure(format!(
            "{} did not confirm rule {} in time",
            endpoint.id, label
        )))
    }

    async fn revoke(&self, target: &str, label: &str) -> Result<(), TunnelError> {
        self.queue
            .enqueue(target, GrantAction::RemoveRule, label, Utc::now())
            .await?;
        Ok(())
    }
}

/// Tries the configured strategies in order; the first confirmation wins
pub struct AccessGrantCoordinator {
    strategies: Vec<Arc<dyn AccessGrant>>,
    rule_grant: Arc<dyn AccessGrant>,
}

impl AccessGrantCoordinator {
    /// `rule_grant` removes labelled rules, including those left by sessions
    /// created under a previous strategy
    pub fn new(strategies: Vec<Arc<dyn AccessGrant>>, rule_grant: Arc<dyn AccessGrant>) -> Self {
        Self {
            strategies,
            rule_grant,
        }
    }

    pub fn from_config(config: &GrantConfig, queue: GrantQueue) -> Self {
        let ephemeral: Arc<dyn AccessGrant> = Arc::new(EphemeralRuleGrant::new(
            queue,
            config.poll_attempts,
            Duration::from_millis(config.poll_interval_ms),
        ));
        let permanent: Arc<dyn AccessGrant> = Arc::new(PermanentGrant::new(Duration::from_secs(
            config.reachability_timeout_secs,
        )));

        let strategies = match config.strategy {
            GrantStrategy::Permanent if config.fallback_to_ephemeral => {
                vec![permanent, ephemeral.clone()]
            }
            GrantStrategy::Permanent => vec![permanent],
            GrantStrategy::Ephemeral => vec![ephemeral.clone()],
        };
        Self::new(strategies, ephemeral)
    }

    pub async fn ensure_granted(
        &self,
        endpoint: &FirewallEndpoint,
        session: &TunnelSession,
    ) -> Result<GrantResult, TunnelError> {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            match strategy.ensure(endpoint, session).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!("{} grant for {} failed: {}", strategy.name(), endpoint.id, e);
                    failures.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        Err(TunnelError::AccessGrantFailure(if failures.is_empty() {
            "no grant strategy configured".to_string()
        } else {
            failures.join("; ")
        }))
    }

    pub async fn revoke(&self, target: &str, label: &str) -> Result<(), TunnelError> {
        self.rule_grant.revoke(target, label).await
    }
}
