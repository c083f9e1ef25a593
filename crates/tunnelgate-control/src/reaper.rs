//! Periodic reconciliation of sessions against their derived resources
//!
//! Each sweep closes sessions past their lifetime, expiry or idle threshold, then
//! stops tunnel processes and removes proxy routes that no active session owns.
//! Sweeps may overlap: every step tolerates the resource already being gone, and
//! only the invocation whose conditional close succeeds reports the reclaim.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunnelgate_db::{SessionStore, TunnelSession};
use tunnelgate_proxy::{DeprovisionResult, ProxyProvisioner};

use crate::config::{PortPool, SessionConfig};
use crate::error::TunnelError;
use crate::grant::AccessGrantCoordinator;
use crate::tunnel::TunnelProcessManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReclaimReason {
    MaxLifetimeExceeded,
    Expired,
    IdleTimeout,
    ManualClose,
}

impl ReclaimReason {
    /// Stored as the session's `closed_reason`
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimReason::MaxLifetimeExceeded => "Max lifetime exceeded",
            ReclaimReason::Expired => "Expired",
            ReclaimReason::IdleTimeout => "Idle timeout",
            ReclaimReason::ManualClose => "Manual close",
        }
    }
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl From<&SessionConfig> for ExpiryPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_lifetime: config.max_lifetime(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Decide whether a session should be reclaimed. Checks run in a fixed order
/// and the first that fires names the reason.
pub fn evaluate(
    session: &TunnelSession,
    last_seen: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: &ExpiryPolicy,
) -> Option<ReclaimReason> {
    if now - session.created_at > policy.max_lifetime {
        Some(ReclaimReason::MaxLifetimeExceeded)
    } else if now > session.expires_at {
        Some(ReclaimReason::Expired)
    } else if now - last_seen > policy.idle_timeout {
        Some(ReclaimReason::IdleTimeout)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimedSession {
    pub session_id: String,
    pub target: String,
    pub tunnel_port: u16,
    pub reason: ReclaimReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub reclaimed: Vec<ReclaimedSession>,
    /// Ports whose tunnel process had no active session
    pub orphan_processes: Vec<u16>,
    /// Sessions whose proxy route outlived them
    pub orphan_routes: Vec<String>,
}

pub struct ExpiryReaper {
    store: SessionStore,
    tunnels: Arc<TunnelProcessManager>,
    proxy: Arc<ProxyProvisioner>,
    grants: Arc<AccessGrantCoordinator>,
    pool: PortPool,
    policy: ExpiryPolicy,
}

impl ExpiryReaper {
    pub fn new(
        store: SessionStore,
        tunnels: Arc<TunnelProcessManager>,
        proxy: Arc<ProxyProvisioner>,
        grants: Arc<AccessGrantCoordinator>,
        pool: PortPool,
        policy: ExpiryPolicy,
    ) -> Self {
        Self {
            store,
            tunnels,
            proxy,
            grants,
            pool,
            policy,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, TunnelError> {
        let mut report = SweepReport::default();

        for session in self.store.list_active().await? {
            report.checked += 1;
            let last_seen = self.last_seen(&session).await;

            let Some(reason) = evaluate(&session, last_seen, now, &self.policy) else {
                continue;
            };
            if self.reclaim(&session, reason, now).await? {
                report.reclaimed.push(ReclaimedSession {
                    session_id: session.id.clone(),
                    target: session.target.clone(),
                    tunnel_port: session.port(),
                    reason,
                });
            }
        }

        report.orphan_processes = self.stop_orphan_processes().await?;
        report.orphan_routes = self.remove_orphan_routes().await?;

        info!(
            "🧹 Sweep checked {} session(s): {} reclaimed, {} orphan process(es), {} orphan route(s)",
            report.checked,
            report.reclaimed.len(),
            report.orphan_processes.len(),
            report.orphan_routes.len()
        );
        Ok(report)
    }

    /// Newest of the proxy's access record and the stored activity. A newer
    /// access record is written back so the store stays informative.
    async fn last_seen(&self, session: &TunnelSession) -> DateTime<Utc> {
        match self.proxy.last_access(&session.id).await {
            Some(seen) if seen > session.last_activity => {
                if let Err(e) = self.store.touch(&session.id, seen).await {
                    warn!("Failed to record activity for session {}: {}", session.id, e);
                }
                seen
            }
            _ => session.last_activity,
        }
    }

    /// Release a session's resources and close it. Returns `false` when another
    /// invocation closed it first.
    ///
    /// Process, route and rule removal are best-effort; the close only happens
    /// after all three were attempted, so an interrupted reclaim leaves an active
    /// row for the next sweep.
    pub async fn reclaim(
        &self,
        session: &TunnelSession,
        reason: ReclaimReason,
        now: DateTime<Utc>,
    ) -> Result<bool, TunnelError> {
        let current = match self.store.get(&session.id).await? {
            Some(current) if current.is_active() => current,
            _ => {
                debug!("Session {} already closed, skipping reclaim", session.id);
                return Ok(false);
            }
        };

        info!("Reclaiming session {} on port {} ({})", session.id, session.port(), reason);

        if let Err(e) = self.tunnels.stop(session.port()).await {
            warn!("Failed to stop tunnel for session {}: {}", session.id, e);
        }
        match self.proxy.deprovision(&session.id).await {
            Ok(DeprovisionResult::AlreadyRemoved) => {
                debug!("Route for session {} was already gone", session.id)
            }
            Ok(DeprovisionResult::Removed) => {}
            Err(e) => warn!("Failed to remove route for session {}: {}", session.id, e),
        }
        if let Some(label) = &current.rule_label {
            // Overlapping reclaims race for the label; only the winner queues the removal
            match self.store.take_rule_label(&session.id, label).await {
                Ok(true) => {
                    if let Err(e) = self.grants.revoke(&session.target, label).await {
                        warn!("Failed to queue removal of rule {}: {}", label, e);
                    }
                }
                Ok(false) => debug!("Rule {} already being removed", label),
                Err(e) => warn!("Failed to claim rule {} for removal: {}", label, e),
            }
        }

        Ok(self.store.close(&session.id, reason.as_str(), now).await?)
    }

    async fn stop_orphan_processes(&self) -> Result<Vec<u16>, TunnelError> {
        // Processes are listed before the store is read, so a tunnel spawned for a
        // session created in between is seen with its row
        let running: BTreeSet<u16> = self
            .tunnels
            .inspector()
            .list_tunnels()
            .await?
            .into_iter()
            .map(|process| process.local_port)
            .filter(|port| self.pool.contains(*port))
            .collect();
        if running.is_empty() {
            return Ok(Vec::new());
        }

        let held = self.store.active_ports().await?;
        let mut stopped = Vec::new();
        for port in running.difference(&held) {
            warn!("Orphan tunnel process on port {}, stopping it", port);
            match self.tunnels.stop(*port).await {
                Ok(_) => stopped.push(*port),
                Err(e) => warn!("Failed to stop orphan tunnel on port {}: {}", port, e),
            }
        }
        Ok(stopped)
    }

    async fn remove_orphan_routes(&self) -> Result<Vec<String>, TunnelError> {
        let mut removed = Vec::new();
        for session_id in self.proxy.list_fragments().await? {
            let owned = self
                .store
                .get(&session_id)
                .await?
                .is_some_and(|session| session.is_active());
            if owned {
                continue;
            }

            warn!("Proxy route for session {} has no active session, removing it", session_id);
            match self.proxy.deprovision(&session_id).await {
                Ok(_) => removed.push(session_id),
                Err(e) => warn!("Failed to remove orphan route {}: {}", session_id, e),
            }
        }
        Ok(removed)
    }
}
