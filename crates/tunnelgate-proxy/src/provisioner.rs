//! Per-session route provisioning with validate-before-activate

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, RouteMode};
use crate::lock::ConfigLock;
use crate::model::{validate_session_id, Exposure, ModelError, SessionRoute};
use crate::runner::{CommandRunner, SystemCommandRunner};

const FRAGMENT_PREFIX: &str = "session-";
const FRAGMENT_SUFFIX: &str = ".conf";
const AGGREGATE_HEADER: &str =
    "# Managed by tunnelgate. Regenerated from the fragment directory on every change.\n";

#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The candidate configuration failed the proxy's syntax check
    #[error("Proxy configuration invalid: {0}")]
    ConfigInvalid(String),

    /// The configuration validated but the running proxy refused to reload
    #[error("Proxy reload failed: {0}")]
    ReloadFailed(String),

    #[error("Invalid route: {0}")]
    InvalidRoute(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionResult {
    pub session_id: String,
    /// Route recorded on the session (path or `:port`)
    pub route: String,
    pub public_url: String,
    pub fragment_path: PathBuf,
    /// False when an identical fragment was already active
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeprovisionResult {
    Removed,
    AlreadyRemoved,
}

/// Bytes of the files a change touches, so a failed change can be undone exactly
struct Snapshot {
    fragment_path: PathBuf,
    fragment: Option<Vec<u8>>,
    aggregate_path: PathBuf,
    aggregate: Option<Vec<u8>>,
}

impl Snapshot {
    async fn take(fragment_path: &Path, aggregate_path: &Path) -> io::Result<Self> {
        Ok(Self {
            fragment_path: fragment_path.to_path_buf(),
            fragment: read_optional(fragment_path).await?,
            aggregate_path: aggregate_path.to_path_buf(),
            aggregate: read_optional(aggregate_path).await?,
        })
    }

    async fn restore(&self) -> io::Result<()> {
        restore_file(&self.fragment_path, self.fragment.as_deref()).await?;
        restore_file(&self.aggregate_path, self.aggregate.as_deref()).await
    }
}

async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn remove_optional(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

async fn restore_file(path: &Path, contents: Option<&[u8]>) -> io::Result<()> {
    match contents {
        Some(bytes) => write_atomic(path, bytes).await,
        None => remove_optional(path).await.map(|_| ()),
    }
}

/// Write through a temporary sibling and rename, so nginx never reads a torn file
async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await
}

pub struct ProxyProvisioner {
    config: ProxyConfig,
    runner: Arc<dyn CommandRunner>,
}

impl ProxyProvisioner {
    pub fn new(config: ProxyConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Provisioner that runs the configured commands on this host
    pub fn with_system_runner(config: ProxyConfig) -> Self {
        Self::new(config, Arc::new(SystemCommandRunner))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn fragment_path(&self, session_id: &str) -> PathBuf {
        self.config.fragment_dir.join(format!(
            "{}{}{}",
            FRAGMENT_PREFIX, session_id, FRAGMENT_SUFFIX
        ))
    }

    pub fn access_log_path(&self, session_id: &str) -> PathBuf {
        self.config
            .access_log_dir
            .join(format!("{}{}.log", FRAGMENT_PREFIX, session_id))
    }

    /// Build the typed route for a session without touching disk
    pub fn route_for(&self, session_id: &str, local_port: u16) -> Result<SessionRoute, ModelError> {
        validate_session_id(session_id)?;

        let exposure = match &self.config.route {
            RouteMode::Path { prefix } => Exposure::Path {
                path: format!("{}/{}/", prefix.trim_end_matches('/'), session_id),
            },
            RouteMode::Port {
                offset,
                server_name,
                ssl_certificate,
                ssl_certificate_key,
            } => Exposure::Port {
                public_port: local_port.saturating_add(*offset),
                server_name: server_name.clone(),
                tls: ssl_certificate.clone().zip(ssl_certificate_key.clone()),
            },
        };

        Ok(SessionRoute {
            session_id: session_id.to_string(),
            local_port,
            upstream_scheme: self.config.upstream_scheme,
            access_log: self.access_log_path(session_id),
            exposure,
        })
    }

    pub fn public_url(&self, route: &SessionRoute) -> String {
        match &route.exposure {
            Exposure::Path { path } => {
                format!("{}{}", self.config.public_base_url.trim_end_matches('/'), path)
            }
            Exposure::Port {
                public_port,
                server_name,
                tls,
            } => {
                let scheme = if tls.is_some() { "https" } else { "http" };
                format!("{}://{}:{}/", scheme, server_name, public_port)
            }
        }
    }

    /// Install (or refresh) the route for a session.
    ///
    /// On validation or reload failure both the fragment and the aggregate are
    /// restored to their previous bytes before the error is returned.
    pub async fn provision(
        &self,
        session_id: &str,
        local_port: u16,
    ) -> Result<ProvisionResult, ProvisionError> {
        let route = self.route_for(session_id, local_port)?;
        let rendered = route.render()?;
        let fragment_path = self.fragment_path(session_id);

        let _lock = ConfigLock::acquire(&self.config.lock_path).await?;

        let result = ProvisionResult {
            session_id: session_id.to_string(),
            route: route.route_label(),
            public_url: self.public_url(&route),
            fragment_path: fragment_path.clone(),
            changed: true,
        };

        let snapshot = Snapshot::take(&fragment_path, &self.config.aggregate_path).await?;
        // A fragment written by an interrupted call is on disk but not in the
        // aggregate; only skip when both match what activation would produce
        if snapshot.fragment.as_deref() == Some(rendered.as_bytes()) {
            let aggregate = self.render_aggregate().await?;
            if snapshot.aggregate.as_deref() == Some(aggregate.as_bytes()) {
                debug!("Route for session {} already active", session_id);
                return Ok(ProvisionResult {
                    changed: false,
                    ..result
                });
            }
            warn!(
                "Route for session {} is written but not active, activating",
                session_id
            );
        }

        fs::create_dir_all(&self.config.access_log_dir).await?;
        write_atomic(&fragment_path, rendered.as_bytes()).await?;
        self.activate(&snapshot).await?;

        info!(
            "✅ Provisioned route {} -> 127.0.0.1:{} for session {}",
            result.route, local_port, session_id
        );
        Ok(result)
    }

    /// Remove a session's route. A missing fragment is already-removed, not an error.
    pub async fn deprovision(&self, session_id: &str) -> Result<DeprovisionResult, ProvisionError> {
        validate_session_id(session_id)?;
        let fragment_path = self.fragment_path(session_id);

        let _lock = ConfigLock::acquire(&self.config.lock_path).await?;

        let snapshot = Snapshot::take(&fragment_path, &self.config.aggregate_path).await?;
        if snapshot.fragment.is_none() {
            debug!("No route for session {}, nothing to remove", session_id);
            return Ok(DeprovisionResult::AlreadyRemoved);
        }

        remove_optional(&fragment_path).await?;
        self.activate(&snapshot).await?;

        if let Err(e) = remove_optional(&self.access_log_path(session_id)).await {
            warn!("Failed to remove access log for session {}: {}", session_id, e);
        }

        info!("Removed route for session {}", session_id);
        Ok(DeprovisionResult::Removed)
    }

    /// Session ids that currently have a fragment on disk
    pub async fn list_fragments(&self) -> Result<Vec<String>, ProvisionError> {
        let mut entries = match fs::read_dir(&self.config.fragment_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name
                .strip_prefix(FRAGMENT_PREFIX)
                .and_then(|rest| rest.strip_suffix(FRAGMENT_SUFFIX))
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Modification time of the session's access log: the proxy's record of
    /// the last request that went through the route
    pub async fn last_access(&self, session_id: &str) -> Option<DateTime<Utc>> {
        let metadata = fs::metadata(self.access_log_path(session_id)).await.ok()?;
        metadata.modified().ok().map(DateTime::<Utc>::from)
    }

    async fn render_aggregate(&self) -> Result<String, ProvisionError> {
        let mut aggregate = String::from(AGGREGATE_HEADER);
        for id in self.list_fragments().await? {
            let fragment = fs::read_to_string(self.fragment_path(&id)).await?;
            aggregate.push('\n');
            aggregate.push_str(&fragment);
        }
        Ok(aggregate)
    }

    /// Regenerate the aggregate, validate, reload. Rolls back to `snapshot` on failure.
    async fn activate(&self, snapshot: &Snapshot) -> Result<(), ProvisionError> {
        let outcome = self.try_activate().await;
        if outcome.is_err() {
            if let Err(e) = snapshot.restore().await {
                warn!("Failed to restore previous proxy configuration: {}", e);
            }
        }
        outcome
    }

    async fn try_activate(&self) -> Result<(), ProvisionError> {
        let aggregate = self.render_aggregate().await?;
        write_atomic(&self.config.aggregate_path, aggregate.as_bytes()).await?;

        match self.runner.run(&self.config.validate_command).await {
            Ok(output) if output.success => {}
            Ok(output) => {
                warn!("Proxy configuration rejected: {}", output.summary());
                return Err(ProvisionError::ConfigInvalid(output.summary()));
            }
            Err(e) => {
                return Err(ProvisionError::ConfigInvalid(format!(
                    "validate command could not run: {}",
                    e
                )));
            }
        }

        match self.runner.run(&self.config.reload_command).await {
            Ok(output) if output.success => Ok(()),
            Ok(output) => {
                warn!("Proxy refused reload: {}", output.summary());
                Err(ProvisionError::ReloadFailed(output.summary()))
            }
            Err(e) => Err(ProvisionError::ReloadFailed(format!(
                "reload command could not run: {}",
                e
            ))),
        }
    }
}
