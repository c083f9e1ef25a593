//! Lifecycle of the SSH client that carries a session's traffic

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::process::{PortProbe, ProcessInspector};
use crate::registry::FirewallEndpoint;

/// Command line for a tunnel forwarding `127.0.0.1:<local_port>` to the
/// firewall's web UI. The local end is bound to loopback only; the reverse
/// proxy is the sole way in from outside.
pub fn ssh_command(config: &TunnelConfig, endpoint: &FirewallEndpoint, local_port: u16) -> Vec<String> {
    let mut argv = vec![
        config.ssh_binary.clone(),
        "-N".to_string(),
        "-L".to_string(),
        format!("127.0.0.1:{}:127.0.0.1:{}", local_port, endpoint.web_port),
        "-p".to_string(),
        endpoint.ssh_port.to_string(),
    ];

    let mut option = |value: String| {
        argv.push("-o".to_string());
        argv.push(value);
    };
    option("ExitOnForwardFailure=yes".to_string());
    option("BatchMode=yes".to_string());
    option(format!("ConnectTimeout={}", config.connect_timeout_secs));
    option(format!(
        "ServerAliveInterval={}",
        config.server_alive_interval_secs
    ));
    option("ServerAliveCountMax=3".to_string());
    option("StrictHostKeyChecking=accept-new".to_string());
    if let Some(known_hosts) = &config.known_hosts_file {
        option(format!("UserKnownHostsFile={}", known_hosts.display()));
    }

    if let Some(identity) = endpoint.identity_file.as_ref().or(config.identity_file.as_ref()) {
        argv.push("-i".to_string());
        argv.push(identity.display().to_string());
    }

    argv.push(format!("{}@{}", endpoint.ssh_user, endpoint.hostname));
    argv
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartResult {
    pub local_port: u16,
    pub pid: u32,
    /// The endpoint answered within the readiness bound
    pub ready: bool,
    /// An existing responsive process was kept instead of spawning a new one
    pub reused: bool,
}

impl StartResult {
    /// Still negotiating; retry later rather than treating it as failed
    pub fn is_pending(&self) -> bool {
        !self.ready
    }
}

pub struct TunnelProcessManager {
    inspector: Arc<dyn ProcessInspector>,
    probe: Arc<dyn PortProbe>,
    config: TunnelConfig,
}

impl TunnelProcessManager {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        probe: Arc<dyn PortProbe>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            inspector,
            probe,
            config,
        }
    }

    pub fn inspector(&self) -> &Arc<dyn ProcessInspector> {
        &self.inspector
    }

    fn probe_timeout(&self) -> Duration {
        self.config.readiness_interval().max(Duration::from_millis(500))
    }

    pub async fn start(
        &self,
        endpoint: &FirewallEndpoint,
        local_port: u16,
    ) -> Result<StartResult, TunnelError> {
        let existing = self.inspector.find_tunnels(local_port).await?;
        if let Some(process) = existing.first() {
            if self.probe.responds(local_port, self.probe_timeout()).await {
                info!(
                    "Reusing tunnel process {} on 127.0.0.1:{}",
                    process.pid, local_port
                );
                return Ok(StartResult {
                    local_port,
                    pid: process.pid,
                    ready: true,
                    reused: true,
                });
            }
            warn!(
                "Tunnel process {} on port {} is not responding, replacing it",
                process.pid, local_port
            );
            self.stop(local_port).await?;
        }

        let argv = ssh_command(&self.config, endpoint, local_port);
        let pid = self.inspector.spawn_detached(&argv).await.map_err(|e| {
            TunnelError::ProcessSpawnFailure(format!("{}: {}", self.config.ssh_binary, e))
        })?;
        info!(
            "🚀 Started tunnel {} -> {}:{} (pid {}, local port {})",
            endpoint.id, endpoint.hostname, endpoint.web_port, pid, local_port
        );

        for attempt in 1..=self.config.readiness_attempts {
            tokio::time::sleep(self.config.readiness_interval()).await;

            let alive = self
                .inspector
                .find_tunnels(local_port)
                .await?
                .iter()
                .any(|process| process.pid == pid);
            if !alive {
                return Err(TunnelError::ProcessSpawnFailure(format!(
                    "tunnel to {} exited during startup (authentication or port forward refused)",
                    endpoint.hostname
                )));
            }

            if self.probe.responds(local_port, self.probe_timeout()).await {
                info!("✅ Tunnel on port {} ready after {} check(s)", local_port, attempt);
                return Ok(StartResult {
                    local_port,
                    pid,
                    ready: true,
                    reused: false,
                });
            }
            debug!("Tunnel on port {} not ready (attempt {})", local_port, attempt);
        }

        warn!(
            "Tunnel on port {} not answering yet, leaving it to finish negotiating",
            local_port
        );
        Ok(StartResult {
            local_port,
            pid,
            ready: false,
            reused: false,
        })
    }

    pub async fn is_running(&self, local_port: u16) -> Result<bool, TunnelError> {
        Ok(!self.inspector.find_tunnels(local_port).await?.is_empty())
    }

    /// Terminate every tunnel bound to the port. Returns how many were signalled;
    /// zero means it was already stopped.
    pub async fn stop(&self, local_port: u16) -> Result<usize, TunnelError> {
        let processes = self.inspector.find_tunnels(local_port).await?;
        let mut stopped = 0;
        let mut first_error = None;
        for process in &processes {
            match self.inspector.terminate(process.pid).await {
                Ok(()) => {
                    stopped += 1;
                    info!("Stopped tunnel process {} on port {}", process.pid, local_port);
                }
                Err(e) => {
                    warn!(
                        "Failed to stop tunnel process {} on port {}: {}",
                        process.pid, local_port, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn endpoint() -> FirewallEndpoint {
        FirewallEndpoint {
            id: "fw-1".to_string(),
            hostname: "fw.example.com".to_string(),
            ssh_port: 2222,
            ssh_user: "admin".to_string(),
            web_port: 4443,
            identity_file: None,
        }
    }

    #[test]
    fn test_forward_binds_loopback_only() {
        let argv = ssh_command(&TunnelConfig::default(), &endpoint(), 8100);

        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"-N".to_string()));
        let forward = argv.iter().position(|arg| arg == "-L").unwrap();
        assert_eq!(argv[forward + 1], "127.0.0.1:8100:127.0.0.1:4443");
        assert!(argv.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert_eq!(argv.last().unwrap(), "admin@fw.example.com");
        assert_eq!(crate::process::forwarded_port(&argv), Some(8100));
    }

    #[test]
    fn test_endpoint_identity_overrides_global() {
        let config = TunnelConfig {
            identity_file: Some(PathBuf::from("/etc/tunnelgate/id_ed25519")),
            ..TunnelConfig::default()
        };

        let argv = ssh_command(&config, &endpoint(), 8100);
        assert!(argv.contains(&"/etc/tunnelgate/id_ed25519".to_string()));

        let own = FirewallEndpoint {
            identity_file: Some(PathBuf::from("/etc/tunnelgate/fw-1.key")),
            ..endpoint()
        };
        let argv = ssh_command(&config, &own, 8100);
        assert!(argv.contains(&"/etc/tunnelgate/fw-1.key".to_string()));
        assert!(!argv.contains(&"/etc/tunnelgate/id_ed25519".to_string()));
    }
}
