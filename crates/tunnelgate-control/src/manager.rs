//! Session orchestration: the request path and the operational verbs
//!
//! A request walks store → allocator → grant → tunnel → proxy → store. Once a new
//! row exists, any failure rolls everything acquired so far back and deletes the
//! row, so a failed request never leaves a session pointing at nothing.

use chrono::{DateTime, Duration, Utc};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use tunnelgate_db::{GrantQueue, NewSession, SessionStore, StoreError, TunnelSession};
use tunnelgate_proxy::{DeprovisionResult, ProvisionError, ProvisionResult, ProxyProvisioner};

use crate::allocator::PortAllocator;
use crate::config::{ManagerConfig, SessionConfig};
use crate::error::TunnelError;
use crate::grant::{AccessGrantCoordinator, GrantResult};
use crate::process::{PortProbe, ProcessInspector, SystemPortProbe, SystemProcessInspector};
use crate::reaper::{ExpiryPolicy, ExpiryReaper, ReclaimReason, SweepReport};
use crate::registry::{DbFirewallRegistry, FirewallEndpoint, FirewallRegistry};
use crate::tunnel::{StartResult, TunnelProcessManager};

/// Outcome of a successful access request
#[derive(Debug, Clone, Serialize)]
pub struct SessionGrant {
    pub session: TunnelSession,
    pub public_url: String,
    /// False when an existing session for the same target and source was extended
    pub created: bool,
    pub tunnel: StartResult,
    pub grant: GrantResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session: TunnelSession,
    pub running: bool,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub target: String,
    pub sessions: Vec<SessionView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseResult {
    pub session_id: String,
    /// False when the session was already closed
    pub closed: bool,
}

pub struct SessionManager {
    store: SessionStore,
    registry: Arc<dyn FirewallRegistry>,
    allocator: PortAllocator,
    grants: Arc<AccessGrantCoordinator>,
    tunnels: Arc<TunnelProcessManager>,
    proxy: Arc<ProxyProvisioner>,
    reaper: ExpiryReaper,
    sessions: SessionConfig,
}

impl SessionManager {
    pub fn new(
        config: &ManagerConfig,
        store: SessionStore,
        registry: Arc<dyn FirewallRegistry>,
        grants: AccessGrantCoordinator,
        inspector: Arc<dyn ProcessInspector>,
        probe: Arc<dyn PortProbe>,
        proxy: ProxyProvisioner,
    ) -> Self {
        let grants = Arc::new(grants);
        let proxy = Arc::new(proxy);
        let tunnels = Arc::new(TunnelProcessManager::new(
            inspector,
            probe.clone(),
            config.tunnel.clone(),
        ));
        let allocator = PortAllocator::new(store.clone(), config.ports, probe);
        let reaper = ExpiryReaper::new(
            store.clone(),
            tunnels.clone(),
            proxy.clone(),
            grants.clone(),
            config.ports,
            ExpiryPolicy::from(&config.session),
        );

        Self {
            store,
            registry,
            allocator,
            grants,
            tunnels,
            proxy,
            reaper,
            sessions: config.session.clone(),
        }
    }

    /// Manager wired to this host's processes, sockets and nginx
    pub fn with_system(config: &ManagerConfig, db: DatabaseConnection) -> Self {
        Self::new(
            config,
            SessionStore::new(db.clone()),
            Arc::new(DbFirewallRegistry::new(db.clone())),
            AccessGrantCoordinator::from_config(&config.grant, GrantQueue::new(db)),
            Arc::new(SystemProcessInspector),
            Arc::new(SystemPortProbe),
            ProxyProvisioner::with_system_runner(config.proxy.clone()),
        )
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn reaper(&self) -> &ExpiryReaper {
        &self.reaper
    }

    fn resolve_ttl(&self, duration: Option<Duration>) -> Result<Duration, TunnelError> {
        let ttl = duration.unwrap_or_else(|| self.sessions.default_ttl());
        if ttl <= Duration::zero() {
            return Err(TunnelError::InvalidRequest(format!(
                "duration must be positive, got {}s",
                ttl.num_seconds()
            )));
        }
        Ok(ttl.min(self.sessions.max_lifetime()))
    }

    /// Grant remote access to `target` for `source_ip`, reusing the active
    /// session for that pair if there is one
    pub async fn request(
        &self,
        target: &str,
        source_ip: &str,
        duration: Option<Duration>,
    ) -> Result<SessionGrant, TunnelError> {
        let ttl = self.resolve_ttl(duration)?;
        let endpoint = self
            .registry
            .lookup(target)
            .await?
            .ok_or_else(|| TunnelError::UnknownTarget(target.to_string()))?;

        let (session, created) = self.create_session(target, source_ip, ttl, Utc::now()).await?;

        let mut grant = None;
        let activated = self.activate(&endpoint, &session, &mut grant).await;
        match activated {
            Ok((tunnel, provisioned)) => {
                let session = self
                    .store
                    .get(&session.id)
                    .await?
                    .ok_or_else(|| TunnelError::SessionNotFound(session.id.clone()))?;
                info!(
                    "✅ Session {} for {} from {} live at {} (expires {})",
                    session.id, target, source_ip, provisioned.public_url, session.expires_at
                );
                Ok(SessionGrant {
                    session,
                    public_url: provisioned.public_url,
                    created,
                    tunnel,
                    grant: grant.unwrap_or(GrantResult::Standing),
                })
            }
            Err(e) => {
                warn!("Session request for {} from {} failed: {}", target, source_ip, e);
                if created {
                    self.roll_back(&session, grant.as_ref()).await;
                }
                Err(e)
            }
        }
    }

    /// Insert or extend the row for (target, source_ip). A lost race for a port
    /// moves on to the next free one.
    async fn create_session(
        &self,
        target: &str,
        source_ip: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(TunnelSession, bool), TunnelError> {
        let mut lost = BTreeSet::new();
        loop {
            let port = match self.store.find_active(target, source_ip).await? {
                Some(existing) => existing.port(),
                None => self.allocator.allocate_excluding(&lost).await?,
            };

            let new = NewSession {
                target: target.to_string(),
                source_ip: source_ip.to_string(),
                tunnel_port: port,
                ttl,
                now,
            };
            match self.store.create(new).await {
                Ok(outcome) => {
                    let created = outcome.is_new();
                    return Ok((outcome.into_session(), created));
                }
                Err(StoreError::PortTaken(port)) => {
                    info!("Port {} taken by a concurrent request, trying the next", port);
                    lost.insert(port);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn activate(
        &self,
        endpoint: &FirewallEndpoint,
        session: &TunnelSession,
        granted: &mut Option<GrantResult>,
    ) -> Result<(StartResult, ProvisionResult), TunnelError> {
        let grant = granted.insert(self.grants.ensure_granted(endpoint, session).await?);
        if let Some(label) = grant.rule_label() {
            self.store.set_rule_label(&session.id, Some(label)).await?;
        }

        let tunnel = self.tunnels.start(endpoint, session.port()).await?;
        let provisioned = self.proxy.provision(&session.id, session.port()).await?;
        self.store
            .set_proxy_route(&session.id, &provisioned.route)
            .await?;
        Ok((tunnel, provisioned))
    }

    /// Undo a new session. Removing a route or process that was never created is a no-op.
    async fn roll_back(&self, session: &TunnelSession, grant: Option<&GrantResult>) {
        if let Err(e) = self.proxy.deprovision(&session.id).await {
            warn!("Rollback: failed to remove route for {}: {}", session.id, e);
        }
        if let Err(e) = self.tunnels.stop(session.port()).await {
            warn!("Rollback: failed to stop tunnel on port {}: {}", session.port(), e);
        }
        if let Some(label) = grant.and_then(GrantResult::rule_label) {
            if let Err(e) = self.grants.revoke(&session.target, label).await {
                warn!("Rollback: failed to queue removal of rule {}: {}", label, e);
            }
        }
        match self.store.discard(&session.id).await {
            Ok(_) => info!("Rolled back session {}", session.id),
            Err(e) => warn!("Rollback: failed to discard session {}: {}", session.id, e),
        }
    }

    pub async fn close(&self, session_id: &str) -> Result<CloseResult, TunnelError> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| TunnelError::SessionNotFound(session_id.to_string()))?;

        let closed = self
            .reaper
            .reclaim(&session, ReclaimReason::ManualClose, Utc::now())
            .await?;
        Ok(CloseResult {
            session_id: session_id.to_string(),
            closed,
        })
    }

    pub async fn status(&self, target: &str) -> Result<TargetStatus, TunnelError> {
        let mut sessions = Vec::new();
        for session in self.store.list_active_for_target(target).await? {
            sessions.push(self.view(session).await?);
        }
        Ok(TargetStatus {
            target: target.to_string(),
            sessions,
        })
    }

    /// All active sessions, lowest port first
    pub async fn list(&self) -> Result<Vec<SessionView>, TunnelError> {
        let mut views = Vec::new();
        for session in self.store.list_active().await? {
            views.push(self.view(session).await?);
        }
        Ok(views)
    }

    async fn view(&self, session: TunnelSession) -> Result<SessionView, TunnelError> {
        let running = self.tunnels.is_running(session.port()).await?;
        let public_url = if session.proxy_route.is_some() {
            let route = self
                .proxy
                .route_for(&session.id, session.port())
                .map_err(ProvisionError::from)?;
            Some(self.proxy.public_url(&route))
        } else {
            None
        };
        Ok(SessionView {
            session,
            running,
            public_url,
        })
    }

    /// Install a route for an explicit session id and port.
    ///
    /// A known session must be active, belong to `target` and own `port`; its
    /// route is recorded. An unknown id only gets a port no active session holds.
    pub async fn provision_route(
        &self,
        session_id: &str,
        port: u16,
        target: &str,
    ) -> Result<ProvisionResult, TunnelError> {
        let existing = self.store.get(session_id).await?;
        if let Some(session) = &existing {
            if !session.is_active() {
                return Err(TunnelError::SessionClosed(session_id.to_string()));
            }
            if session.target != target {
                return Err(TunnelError::InvalidRequest(format!(
                    "session {} belongs to {}, not {}",
                    session_id, session.target, target
                )));
            }
            if session.port() != port {
                return Err(TunnelError::InvalidRequest(format!(
                    "session {} uses port {}, not {}",
                    session_id,
                    session.port(),
                    port
                )));
            }
        }

        if existing.is_none() && self.registry.lookup(target).await?.is_none() {
            return Err(TunnelError::UnknownTarget(target.to_string()));
        }

        if let Some(holder) = self.store.find_active_by_port(port).await? {
            if holder.id != session_id {
                return Err(TunnelError::InvalidRequest(format!(
                    "port {} belongs to session {} for {}",
                    port, holder.id, holder.target
                )));
            }
        }

        let provisioned = self.proxy.provision(session_id, port).await?;
        if existing.is_some() {
            self.store
                .set_proxy_route(session_id, &provisioned.route)
                .await?;
        }
        Ok(provisioned)
    }

    pub async fn remove_route(&self, session_id: &str) -> Result<DeprovisionResult, TunnelError> {
        Ok(self.proxy.deprovision(session_id).await?)
    }

    /// One reconciliation sweep
    pub async fn cleanup(&self) -> Result<SweepReport, TunnelError> {
        self.reaper.sweep(Utc::now()).await
    }
}
