//! Manager configuration
//!
//! Every section deserializes with defaults, so an empty file is a valid configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tunnelgate_proxy::ProxyConfig;

use crate::error::TunnelError;

/// The reserved range `[min, max]` tunnel ports are allocated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortPool {
    pub min: u16,
    pub max: u16,
}

impl Default for PortPool {
    fn default() -> Self {
        Self {
            min: 8100,
            max: 8199,
        }
    }
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Ports in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }

    pub fn len(&self) -> usize {
        if self.max < self.min {
            0
        } else {
            usize::from(self.max - self.min) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Used when a request names no duration
    pub default_ttl_minutes: u32,

    /// Hard cap on a session's age, extensions included
    pub max_lifetime_minutes: u32,

    pub idle_timeout_minutes: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl_minutes: 60,
            max_lifetime_minutes: 480,
            idle_timeout_minutes: 30,
        }
    }
}

impl SessionConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::minutes(i64::from(self.default_ttl_minutes))
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::minutes(i64::from(self.max_lifetime_minutes))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::minutes(i64::from(self.idle_timeout_minutes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub ssh_binary: String,

    /// Used for firewalls without their own identity file
    pub identity_file: Option<PathBuf>,

    pub known_hosts_file: Option<PathBuf>,

    pub connect_timeout_secs: u64,

    pub readiness_attempts: u32,

    pub readiness_interval_ms: u64,

    pub server_alive_interval_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            identity_file: None,
            known_hosts_file: None,
            connect_timeout_secs: 10,
            readiness_attempts: 3,
            readiness_interval_ms: 1000,
            server_alive_interval_secs: 30,
        }
    }
}

impl TunnelConfig {
    pub fn readiness_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.readiness_interval_ms)
    }

    pub fn connect_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GrantStrategy {
    /// A standing allow rule installed out of band; granting only verifies reachability
    #[default]
    Permanent,
    /// Legacy per-session rule added through the grant request queue
    Ephemeral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantConfig {
    pub strategy: GrantStrategy,

    /// With the permanent strategy, fall back to a per-session rule when the
    /// endpoint is not reachable
    pub fallback_to_ephemeral: bool,

    pub reachability_timeout_secs: u64,

    pub poll_attempts: u32,

    pub poll_interval_ms: u64,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            strategy: GrantStrategy::default(),
            fallback_to_ephemeral: false,
            reachability_timeout_secs: 5,
            poll_attempts: 15,
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub ports: PortPool,
    pub session: SessionConfig,
    pub tunnel: TunnelConfig,
    pub grant: GrantConfig,
    pub proxy: ProxyConfig,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.ports.is_empty() || self.ports.min == 0 {
            return Err(TunnelError::InvalidConfig(format!(
                "port range {}-{} is empty",
                self.ports.min, self.ports.max
            )));
        }
        if self.session.default_ttl_minutes == 0 {
            return Err(TunnelError::InvalidConfig(
                "session.default_ttl_minutes must be positive".to_string(),
            ));
        }
        if self.session.max_lifetime_minutes < self.session.default_ttl_minutes {
            return Err(TunnelError::InvalidConfig(
                "session.max_lifetime_minutes is shorter than the default ttl".to_string(),
            ));
        }
        if self.proxy.validate_command.is_empty() || self.proxy.reload_command.is_empty() {
            return Err(TunnelError::InvalidConfig(
                "proxy validate and reload commands must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
