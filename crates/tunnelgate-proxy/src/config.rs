//! Proxy provisioning configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Scheme used between nginx and the tunnel's loopback endpoint.
/// Firewall web UIs are normally served over TLS, so the default is https.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    Http,
    #[default]
    Https,
}

impl UpstreamScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Https => "https",
        }
    }
}

/// How a session is exposed to the outside world
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RouteMode {
    /// `location` blocks under a shared server; the aggregate is included inside a `server {}`
    Path {
        #[serde(default = "default_path_prefix")]
        prefix: String,
    },
    /// One `server {}` per session listening on `tunnel_port + offset`;
    /// the aggregate is included at `http {}` level
    Port {
        offset: u16,
        server_name: String,
        #[serde(default)]
        ssl_certificate: Option<PathBuf>,
        #[serde(default)]
        ssl_certificate_key: Option<PathBuf>,
    },
}

fn default_path_prefix() -> String {
    "/tunnel".to_string()
}

impl Default for RouteMode {
    fn default() -> Self {
        RouteMode::Path {
            prefix: default_path_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Directory holding one rendered fragment per session
    pub fragment_dir: PathBuf,

    /// The single file nginx includes; regenerated from all fragments
    pub aggregate_path: PathBuf,

    /// Per-session access logs, used as the activity record for idle detection
    pub access_log_dir: PathBuf,

    /// Exclusive lock serialising writers across invocations
    pub lock_path: PathBuf,

    /// Exit status signals syntax validity
    pub validate_command: Vec<String>,

    /// Exit status signals runtime acceptance
    pub reload_command: Vec<String>,

    pub upstream_scheme: UpstreamScheme,

    pub route: RouteMode,

    /// Public origin used to build path-mode URLs (e.g. `https://manager.example.com`)
    pub public_base_url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            fragment_dir: PathBuf::from("/etc/nginx/tunnelgate/fragments"),
            aggregate_path: PathBuf::from("/etc/nginx/tunnelgate/sessions.conf"),
            access_log_dir: PathBuf::from("/var/log/nginx/tunnelgate"),
            lock_path: PathBuf::from("/run/tunnelgate/proxy.lock"),
            validate_command: vec!["nginx".to_string(), "-t".to_string(), "-q".to_string()],
            reload_command: vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
            upstream_scheme: UpstreamScheme::default(),
            route: RouteMode::default(),
            public_base_url: "https://localhost".to_string(),
        }
    }
}
