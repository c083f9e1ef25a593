//! Provisioning against a scripted proxy

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tunnelgate_proxy::{
    CommandOutput, CommandRunner, DeprovisionResult, ProvisionError, ProxyConfig,
    ProxyProvisioner, RouteMode,
};

/// Answers validate/reload with queued exit statuses and records what ran
#[derive(Default)]
struct ScriptedProxy {
    validate: Mutex<VecDeque<bool>>,
    reload: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProxy {
    fn failing_validation() -> Self {
        let proxy = Self::default();
        proxy.validate.lock().unwrap().push_back(false);
        proxy
    }

    fn failing_reload() -> Self {
        let proxy = Self::default();
        proxy.reload.lock().unwrap().push_back(false);
        proxy
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedProxy {
    async fn run(&self, argv: &[String]) -> io::Result<CommandOutput> {
        let step = argv.last().cloned().unwrap_or_default();
        self.calls.lock().unwrap().push(step.clone());

        let queue = if step == "validate" {
            &self.validate
        } else {
            &self.reload
        };
        let success = queue.lock().unwrap().pop_front().unwrap_or(true);

        Ok(CommandOutput {
            success,
            stdout: String::new(),
            stderr: if success {
                String::new()
            } else {
                format!("nginx: [emerg] {} failed", step)
            },
        })
    }
}

fn test_config(root: &Path) -> ProxyConfig {
    ProxyConfig {
        fragment_dir: root.join("fragments"),
        aggregate_path: root.join("sessions.conf"),
        access_log_dir: root.join("logs"),
        lock_path: root.join("run").join("proxy.lock"),
        validate_command: vec!["proxyctl".to_string(), "validate".to_string()],
        reload_command: vec!["proxyctl".to_string(), "reload".to_string()],
        public_base_url: "https://manager.example.com".to_string(),
        ..ProxyConfig::default()
    }
}

fn provisioner(root: &Path, proxy: Arc<ScriptedProxy>) -> ProxyProvisioner {
    ProxyProvisioner::new(test_config(root), proxy)
}

fn fragment_names(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root.join("fragments"))
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn test_provision_writes_fragment_and_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(ScriptedProxy::default());
    let provisioner = provisioner(dir.path(), proxy.clone());

    let result = provisioner.provision("s1", 8100).await.unwrap();

    assert!(result.changed);
    assert_eq!(result.route, "/tunnel/s1/");
    assert_eq!(result.public_url, "https://manager.example.com/tunnel/s1/");
    assert_eq!(fragment_names(dir.path()), vec!["session-s1.conf"]);

    let aggregate = std::fs::read_to_string(dir.path().join("sessions.conf")).unwrap();
    assert!(aggregate.contains("location ^~ /tunnel/s1/ {"));
    assert!(aggregate.contains("proxy_pass https://127.0.0.1:8100/;"));
    assert_eq!(proxy.calls(), vec!["validate", "reload"]);
}

#[tokio::test]
async fn test_identical_provision_skips_reload() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(ScriptedProxy::default());
    let provisioner = provisioner(dir.path(), proxy.clone());

    provisioner.provision("s1", 8100).await.unwrap();
    let again = provisioner.provision("s1", 8100).await.unwrap();

    assert!(!again.changed);
    assert_eq!(proxy.calls().len(), 2);
}

#[tokio::test]
async fn test_fragment_missing_from_aggregate_is_activated() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(ScriptedProxy::default());
    let provisioner = provisioner(dir.path(), proxy.clone());
    let aggregate_path = dir.path().join("sessions.conf");

    provisioner.provision("s1", 8100).await.unwrap();
    let without_s2 = std::fs::read(&aggregate_path).unwrap();
    provisioner.provision("s2", 8101).await.unwrap();

    // s2's fragment was written but the aggregate never picked it up
    std::fs::write(&aggregate_path, &without_s2).unwrap();

    let again = provisioner.provision("s2", 8101).await.unwrap();

    assert!(again.changed);
    let aggregate = std::fs::read_to_string(&aggregate_path).unwrap();
    assert!(aggregate.contains("/tunnel/s2/"));
    assert_eq!(
        proxy.calls(),
        vec!["validate", "reload", "validate", "reload", "validate", "reload"]
    );
}

#[tokio::test]
async fn test_validation_failure_leaves_configuration_untouched() {
    let dir = tempfile::tempdir().unwrap();

    let healthy = provisioner(dir.path(), Arc::new(ScriptedProxy::default()));
    healthy.provision("s1", 8100).await.unwrap();
    let before = std::fs::read(dir.path().join("sessions.conf")).unwrap();

    let proxy = Arc::new(ScriptedProxy::failing_validation());
    let broken = provisioner(dir.path(), proxy.clone());
    let err = broken.provision("s2", 8101).await.unwrap_err();

    assert!(matches!(err, ProvisionError::ConfigInvalid(_)));
    assert_eq!(std::fs::read(dir.path().join("sessions.conf")).unwrap(), before);
    assert_eq!(fragment_names(dir.path()), vec!["session-s1.conf"]);
    // Never asked to reload a configuration that failed validation
    assert_eq!(proxy.calls(), vec!["validate"]);
}

#[tokio::test]
async fn test_reload_failure_is_distinct_and_restores_files() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(ScriptedProxy::failing_reload());
    let provisioner = provisioner(dir.path(), proxy.clone());

    let err = provisioner.provision("s1", 8100).await.unwrap_err();

    assert!(matches!(err, ProvisionError::ReloadFailed(_)));
    assert!(fragment_names(dir.path()).is_empty());
    assert!(!dir.path().join("sessions.conf").exists());
    assert_eq!(proxy.calls(), vec!["validate", "reload"]);
}

#[tokio::test]
async fn test_provision_then_deprovision_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = provisioner(dir.path(), Arc::new(ScriptedProxy::default()));

    provisioner.provision("keep", 8100).await.unwrap();
    let fragments_before = fragment_names(dir.path());
    let aggregate_before = std::fs::read(dir.path().join("sessions.conf")).unwrap();

    provisioner.provision("temp", 8101).await.unwrap();
    std::fs::write(provisioner.access_log_path("temp"), b"GET /\n").unwrap();
    assert_eq!(
        provisioner.deprovision("temp").await.unwrap(),
        DeprovisionResult::Removed
    );

    assert_eq!(fragment_names(dir.path()), fragments_before);
    assert_eq!(
        std::fs::read(dir.path().join("sessions.conf")).unwrap(),
        aggregate_before
    );
    assert!(!provisioner.access_log_path("temp").exists());
}

#[tokio::test]
async fn test_deprovision_missing_fragment_is_already_removed() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(ScriptedProxy::default());
    let provisioner = provisioner(dir.path(), proxy.clone());

    assert_eq!(
        provisioner.deprovision("ghost").await.unwrap(),
        DeprovisionResult::AlreadyRemoved
    );
    assert!(proxy.calls().is_empty());
}

#[tokio::test]
async fn test_port_mode_exposes_paired_port() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
        route: RouteMode::Port {
            offset: 1000,
            server_name: "fw.example.com".to_string(),
            ssl_certificate: None,
            ssl_certificate_key: None,
        },
        ..test_config(dir.path())
    };
    let provisioner = ProxyProvisioner::new(config, Arc::new(ScriptedProxy::default()));

    let result = provisioner.provision("s1", 8100).await.unwrap();

    assert_eq!(result.route, ":9100");
    assert_eq!(result.public_url, "http://fw.example.com:9100/");
    let aggregate = std::fs::read_to_string(dir.path().join("sessions.conf")).unwrap();
    assert!(aggregate.contains("listen 9100;"));
}

#[tokio::test]
async fn test_last_access_tracks_log_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = provisioner(dir.path(), Arc::new(ScriptedProxy::default()));

    assert!(provisioner.last_access("s1").await.is_none());

    provisioner.provision("s1", 8100).await.unwrap();
    std::fs::write(provisioner.access_log_path("s1"), b"GET /\n").unwrap();

    let seen = provisioner.last_access("s1").await.unwrap();
    let age = chrono::Utc::now() - seen;
    assert!(age < chrono::Duration::seconds(60));
}

#[tokio::test]
async fn test_list_fragments_ignores_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = provisioner(dir.path(), Arc::new(ScriptedProxy::default()));

    provisioner.provision("b", 8101).await.unwrap();
    provisioner.provision("a", 8100).await.unwrap();
    std::fs::write(dir.path().join("fragments").join("README"), b"hands off").unwrap();

    assert_eq!(provisioner.list_fragments().await.unwrap(), vec!["a", "b"]);
}
