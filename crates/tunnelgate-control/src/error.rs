use sea_orm::DbErr;
use thiserror::Error;
use tunnelgate_db::StoreError;
use tunnelgate_proxy::ProvisionError;

/// Errors surfaced by session operations
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("No free tunnel port in range {min}-{max}")]
    AllocationExhausted { min: u16, max: u16 },

    #[error("Tunnel process failed to start: {0}")]
    ProcessSpawnFailure(String),

    #[error("Proxy configuration invalid: {0}")]
    ProxyConfigInvalid(String),

    #[error("Proxy reload failed: {0}")]
    ProxyReloadFailure(String),

    #[error("Access grant failed: {0}")]
    AccessGrantFailure(String),

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Proxy error: {0}")]
    Proxy(ProvisionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Stable machine-readable classification for CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::AllocationExhausted { .. } => "allocation_exhausted",
            TunnelError::ProcessSpawnFailure(_) => "process_spawn_failure",
            TunnelError::ProxyConfigInvalid(_) => "proxy_config_invalid",
            TunnelError::ProxyReloadFailure(_) => "proxy_reload_failure",
            TunnelError::AccessGrantFailure(_) => "access_grant_failure",
            TunnelError::UnknownTarget(_) => "unknown_target",
            TunnelError::SessionNotFound(_) => "session_not_found",
            TunnelError::SessionClosed(_) => "session_closed",
            TunnelError::InvalidRequest(_) => "invalid_request",
            TunnelError::InvalidConfig(_) => "invalid_config",
            TunnelError::Store(_) => "store_error",
            TunnelError::Proxy(_) => "proxy_error",
            TunnelError::Io(_) => "io_error",
        }
    }
}

impl From<StoreError> for TunnelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => TunnelError::SessionNotFound(id),
            StoreError::NotActive(id) => TunnelError::SessionClosed(id),
            StoreError::InvalidExpiry(msg) => TunnelError::InvalidRequest(msg),
            other => TunnelError::Store(other),
        }
    }
}

impl From<DbErr> for TunnelError {
    fn from(err: DbErr) -> Self {
        TunnelError::Store(StoreError::Database(err))
    }
}

impl From<ProvisionError> for TunnelError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::ConfigInvalid(msg) => TunnelError::ProxyConfigInvalid(msg),
            ProvisionError::ReloadFailed(msg) => TunnelError::ProxyReloadFailure(msg),
            other => TunnelError::Proxy(other),
        }
    }
}
