//! Command-line surface

use chrono::Duration;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tunnelgate - ephemeral remote access to firewall web UIs
#[derive(Parser, Debug)]
#[command(name = "tunnelgate")]
#[command(about = "Tunnelgate - ephemeral remote access to firewall web UIs")]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(long, global = true, env = "TUNNELGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database URL, overriding the configuration file
    #[arg(long, global = true, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Install the proxy route for a session
    Create {
        session: String,
        port: u16,
        target: String,
    },

    /// Remove the proxy route for a session
    Remove { session: String },

    /// Reclaim expired, idle and orphaned resources
    #[command(long_about = r#"
Run one reconciliation sweep: close sessions past their maximum lifetime,
expiry or idle timeout, then stop tunnel processes and remove proxy routes
that no active session owns.

Normally invoked from cron or a systemd timer. With --interval the sweep
repeats until interrupted.

EXAMPLES:
  # One sweep
  tunnelgate cleanup

  # Sweep every minute in the foreground
  tunnelgate cleanup --interval 60
    "#)]
    Cleanup {
        /// Repeat every N seconds instead of running once
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Request remote access to a firewall
    Request {
        target: String,

        /// How long the session should last: `90`, `90m`, `2h`, `1d` (bare numbers are minutes)
        #[arg(value_parser = parse_duration)]
        duration: Option<Duration>,

        /// Address of the requester; one session is kept per target and source
        #[arg(long, env = "TUNNELGATE_SOURCE_IP", default_value = "127.0.0.1")]
        source_ip: String,
    },

    /// Close a session and release its resources
    Close { session: String },

    /// Show active sessions for a firewall
    Status { target: String },

    /// List all active sessions
    List,

    /// Run database migrations
    Migrate,
}

/// Parse `45s`, `30m`, `2h`, `1d` or a bare number of minutes
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);

    let amount: i64 = amount
        .parse()
        .map_err(|_| format!("invalid duration: {:?}", value))?;
    if amount <= 0 {
        return Err(format!("duration must be positive: {:?}", value));
    }

    match unit {
        "s" => Ok(Duration::seconds(amount)),
        "" | "m" => Ok(Duration::minutes(amount)),
        "h" => Ok(Duration::hours(amount)),
        "d" => Ok(Duration::days(amount)),
        other => Err(format!("unknown duration unit {:?} (use s, m, h or d)", other)),
    }
}
