//! Configuration file discovery and loading
//!
//! Looked up in order: `--config` / `$TUNNELGATE_CONFIG`, `./tunnelgate.yml`,
//! `<config dir>/tunnelgate/config.yml`, `/etc/tunnelgate/config.yml`.
//! Without a file every setting takes its default.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tunnelgate_control::ManagerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,

    #[serde(flatten)]
    pub manager: ManagerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:///var/lib/tunnelgate/sessions.db?mode=rwc".to_string(),
            manager: ManagerConfig::default(),
        }
    }
}

fn candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("tunnelgate.yml")];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("tunnelgate").join("config.yml"));
    }
    paths.push(PathBuf::from("/etc/tunnelgate/config.yml"));
    paths
}

/// The file that will be loaded, if any
pub fn discover(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!("Config file not found: {:?}", path);
        }
        return Ok(Some(path.to_path_buf()));
    }
    Ok(candidates().into_iter().find(|path| path.is_file()))
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    let yaml =
        fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

    // An empty file is a valid, all-defaults configuration
    if yaml.trim().is_empty() {
        return Ok(AppConfig::default());
    }

    let config: AppConfig = serde_yaml::from_str(&yaml)
        .context(format!("Failed to parse config file: {:?}", path))?;
    Ok(config)
}

/// Load the effective configuration. `database_url` overrides the file.
pub fn load(explicit: Option<&Path>, database_url: Option<&str>) -> Result<AppConfig> {
    let mut config = match discover(explicit)? {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            load_from(&path)?
        }
        None => {
            debug!("No configuration file found, using defaults");
            AppConfig::default()
        }
    };

    if let Some(url) = database_url {
        config.database_url = url.to_string();
    }

    config
        .manager
        .validate()
        .context("Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelgate_control::GrantStrategy;
    use tunnelgate_proxy::RouteMode;

    #[test]
    fn test_yaml_sections_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            r#"
database_url: "sqlite::memory:"
ports:
  min: 8100
  max: 8104
session:
  idle_timeout_minutes: 15
grant:
  strategy: permanent
  fallback_to_ephemeral: true
proxy:
  fragment_dir: /tmp/fragments
  route:
    mode: port
    offset: 1000
    server_name: fw.example.com
"#,
        )
        .unwrap();

        let config = load(Some(&path), None).unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.manager.ports.max, 8104);
        assert_eq!(config.manager.session.idle_timeout_minutes, 15);
        assert_eq!(config.manager.session.default_ttl_minutes, 60);
        assert_eq!(config.manager.grant.strategy, GrantStrategy::Permanent);
        assert!(config.manager.grant.fallback_to_ephemeral);
        assert_eq!(
            config.manager.proxy.fragment_dir,
            PathBuf::from("/tmp/fragments")
        );
        assert!(matches!(
            config.manager.proxy.route,
            RouteMode::Port { offset: 1000, .. }
        ));
    }

    #[test]
    fn test_database_url_flag_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "database_url: postgres://db/tunnelgate\n").unwrap();

        let config = load(Some(&path), Some("sqlite::memory:")).unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
    }

    #[test]
    fn test_empty_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "").unwrap();

        let config = load_from(&path).unwrap();
        assert_eq!(config.manager.ports.min, 8100);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(Some(&dir.path().join("nope.yml"))).is_err());
    }

    #[test]
    fn test_invalid_pool_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "ports:\n  min: 9000\n  max: 8000\n").unwrap();

        assert!(load(Some(&path), None).is_err());
    }
}
