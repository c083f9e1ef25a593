//! Fakes for the OS and the proxy daemon, plus a wired-up manager

#![allow(dead_code)]

use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tunnelgate_control::process::forwarded_port;
use tunnelgate_control::{
    AccessGrant, AccessGrantCoordinator, FirewallEndpoint, GrantResult, ManagerConfig, PortPool,
    PortProbe, ProcessInspector, SessionManager, TunnelError, TunnelProcess,
};
use tunnelgate_db::entities::firewall;
use tunnelgate_db::{SessionStore, TunnelSession};
use tunnelgate_proxy::{CommandOutput, CommandRunner, ProxyConfig, ProxyProvisioner};

#[derive(Default)]
struct HostState {
    next_pid: u32,
    tunnels: BTreeMap<u32, u16>,
    foreign: BTreeSet<u16>,
    unresponsive: BTreeSet<u16>,
    spawned: Vec<Vec<String>>,
    terminated: Vec<u32>,
    protected: BTreeSet<u32>,
}

/// In-memory process table and socket state
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    /// Spawned tunnels exit immediately, as with a rejected key
    pub die_on_spawn: AtomicBool,
}

impl FakeHost {
    /// A tunnel process that no session knows about
    pub fn add_tunnel(&self, port: u16) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.next_pid += 1;
        let pid = 10_000 + state.next_pid;
        state.tunnels.insert(pid, port);
        pid
    }

    /// Something other than a tunnel bound to the port
    pub fn occupy(&self, port: u16) {
        self.state.lock().unwrap().foreign.insert(port);
    }

    pub fn make_unresponsive(&self, port: u16) {
        self.state.lock().unwrap().unresponsive.insert(port);
    }

    pub fn tunnel_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.state.lock().unwrap().tunnels.values().copied().collect();
        ports.sort();
        ports
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawned.len()
    }

    pub fn last_spawn(&self) -> Option<Vec<String>> {
        self.state.lock().unwrap().spawned.last().cloned()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.state.lock().unwrap().terminated.clone()
    }

    /// Signals to this pid fail, as for a process owned by another user
    pub fn protect(&self, pid: u32) {
        self.state.lock().unwrap().protected.insert(pid);
    }
}

#[async_trait]
impl ProcessInspector for FakeHost {
    async fn list_tunnels(&self) -> io::Result<Vec<TunnelProcess>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tunnels
            .iter()
            .map(|(pid, port)| TunnelProcess {
                pid: *pid,
                local_port: *port,
                command: format!("ssh -N -L 127.0.0.1:{}:127.0.0.1:443", port),
            })
            .collect())
    }

    async fn spawn_detached(&self, argv: &[String]) -> io::Result<u32> {
        let mut state = self.state.lock().unwrap();
        state.spawned.push(argv.to_vec());
        state.next_pid += 1;
        let pid = 10_000 + state.next_pid;

        if !self.die_on_spawn.load(Ordering::SeqCst) {
            let port = forwarded_port(argv)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no forward"))?;
            state.tunnels.insert(pid, port);
        }
        Ok(pid)
    }

    async fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.protected.contains(&pid) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        state.tunnels.remove(&pid);
        state.terminated.push(pid);
        Ok(())
    }
}

#[async_trait]
impl PortProbe for FakeHost {
    fn is_listening(&self, port: u16) -> bool {
        let state = self.state.lock().unwrap();
        state.foreign.contains(&port) || state.tunnels.values().any(|p| *p == port)
    }

    async fn responds(&self, port: u16, _timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        state.tunnels.values().any(|p| *p == port) && !state.unresponsive.contains(&port)
    }
}

/// Proxy daemon whose validate step can be made to fail
#[derive(Default)]
pub struct FakeProxy {
    pub reject_config: AtomicBool,
    pub validations: AtomicUsize,
    pub reloads: AtomicUsize,
}

#[async_trait]
impl CommandRunner for FakeProxy {
    async fn run(&self, argv: &[String]) -> io::Result<CommandOutput> {
        let success = if argv.iter().any(|arg| arg == "-t") {
            self.validations.fetch_add(1, Ordering::SeqCst);
            !self.reject_config.load(Ordering::SeqCst)
        } else {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            true
        };

        Ok(CommandOutput {
            success,
            stdout: String::new(),
            stderr: if success {
                String::new()
            } else {
                "nginx: [emerg] invalid number of arguments in \"proxy_pass\"".to_string()
            },
        })
    }
}

/// Grant that always confirms and records revocations
#[derive(Default)]
pub struct OpenGrant {
    pub revoked: Mutex<Vec<String>>,
}

#[async_trait]
impl AccessGrant for OpenGrant {
    fn name(&self) -> &'static str {
        "open"
    }

    async fn ensure(
        &self,
        _endpoint: &FirewallEndpoint,
        _session: &TunnelSession,
    ) -> Result<GrantResult, TunnelError> {
        Ok(GrantResult::Standing)
    }

    async fn revoke(&self, _target: &str, label: &str) -> Result<(), TunnelError> {
        self.revoked.lock().unwrap().push(label.to_string());
        Ok(())
    }
}

pub fn proxy_config(root: &Path) -> ProxyConfig {
    ProxyConfig {
        fragment_dir: root.join("fragments"),
        aggregate_path: root.join("sessions.conf"),
        access_log_dir: root.join("logs"),
        lock_path: root.join("proxy.lock"),
        public_base_url: "https://manager.example.com".to_string(),
        ..ProxyConfig::default()
    }
}

pub fn manager_config(root: &Path, min: u16, max: u16) -> ManagerConfig {
    let mut config = ManagerConfig {
        ports: PortPool::new(min, max),
        proxy: proxy_config(root),
        ..ManagerConfig::default()
    };
    config.tunnel.readiness_interval_ms = 0;
    config.grant.poll_interval_ms = 10;
    config
}

pub async fn database() -> DatabaseConnection {
    let db = tunnelgate_db::connect("sqlite::memory:").await.unwrap();
    tunnelgate_db::migrate(&db).await.unwrap();
    db
}

pub async fn add_firewall(db: &DatabaseConnection, id: &str) {
    firewall::ActiveModel {
        id: Set(id.to_string()),
        hostname: Set(format!("{}.example.com", id)),
        ssh_port: Set(22),
        ssh_user: Set("admin".to_string()),
        web_port: Set(443),
        identity_file: Set(None),
    }
    .insert(db)
    .await
    .unwrap();
}

pub struct Harness {
    pub manager: SessionManager,
    pub host: Arc<FakeHost>,
    pub proxy: Arc<FakeProxy>,
    pub grant: Arc<OpenGrant>,
    pub store: SessionStore,
    pub db: DatabaseConnection,
    pub config: ManagerConfig,
    pub dir: TempDir,
}

impl Harness {
    pub fn aggregate_path(&self) -> PathBuf {
        self.config.proxy.aggregate_path.clone()
    }

    pub fn fragments(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.config.proxy.fragment_dir)
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn access_log(&self, session_id: &str) -> PathBuf {
        self.config
            .proxy
            .access_log_dir
            .join(format!("session-{}.log", session_id))
    }
}

pub async fn harness_with(config_for: impl FnOnce(&Path) -> ManagerConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());
    let db = database().await;
    add_firewall(&db, "fw-1").await;
    add_firewall(&db, "fw-2").await;

    let host = Arc::new(FakeHost::default());
    let proxy = Arc::new(FakeProxy::default());
    let grant = Arc::new(OpenGrant::default());
    let store = SessionStore::new(db.clone());

    let manager = SessionManager::new(
        &config,
        store.clone(),
        Arc::new(tunnelgate_control::DbFirewallRegistry::new(db.clone())),
        AccessGrantCoordinator::new(vec![grant.clone() as Arc<dyn AccessGrant>], grant.clone()),
        host.clone(),
        host.clone(),
        ProxyProvisioner::new(config.proxy.clone(), proxy.clone()),
    );

    Harness {
        manager,
        host,
        proxy,
        grant,
        store,
        db,
        config,
        dir,
    }
}

pub async fn harness(min: u16, max: u16) -> Harness {
    harness_with(|root| manager_config(root, min, max)).await
}
