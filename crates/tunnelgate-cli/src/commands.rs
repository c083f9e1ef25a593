//! Verb dispatch
//!
//! Every verb prints one JSON document on stdout: `{"success": true, "result": ...}`
//! or `{"success": false, "error": <kind>, "message": <text>}`. Logs go to stderr.

use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};
use tunnelgate_control::{SessionManager, TunnelError};
use tunnelgate_proxy::DeprovisionResult;

use crate::cli::{Cli, Command};
use crate::config;

/// A failed verb, as reported to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub error: String,
    pub message: String,
}

impl From<TunnelError> for Failure {
    fn from(err: TunnelError) -> Self {
        Self {
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            error: "setup_error".to_string(),
            message: format!("{:#}", err),
        }
    }
}

pub fn success_document(result: Value) -> Value {
    json!({ "success": true, "result": result })
}

pub fn failure_document(failure: &Failure) -> Value {
    json!({
        "success": false,
        "error": failure.error,
        "message": failure.message,
    })
}

fn print(document: &Value) {
    match serde_json::to_string_pretty(document) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("Failed to encode output: {}", e),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, Failure> {
    serde_json::to_value(value).map_err(|e| Failure {
        error: "encoding_error".to_string(),
        message: e.to_string(),
    })
}

/// Run the parsed command line and return the process exit code
pub async fn execute(cli: Cli) -> i32 {
    match run(cli).await {
        Ok(result) => {
            print(&success_document(result));
            0
        }
        Err(failure) => {
            error!("❌ {}: {}", failure.error, failure.message);
            print(&failure_document(&failure));
            1
        }
    }
}

async fn run(cli: Cli) -> Result<Value, Failure> {
    let app = config::load(cli.config.as_deref(), cli.database_url.as_deref())?;

    let db = tunnelgate_db::connect(&app.database_url)
        .await
        .map_err(TunnelError::from)?;
    tunnelgate_db::migrate(&db).await.map_err(TunnelError::from)?;

    if cli.command == Command::Migrate {
        return Ok(json!({ "migrated": true }));
    }

    let manager = SessionManager::with_system(&app.manager, db);

    if let Command::Cleanup {
        interval: Some(secs),
    } = cli.command
    {
        return cleanup_loop(&manager, Duration::from_secs(secs.max(1))).await;
    }

    dispatch(&manager, &cli.command).await
}

/// Run a single verb against a manager
pub async fn dispatch(manager: &SessionManager, command: &Command) -> Result<Value, Failure> {
    match command {
        Command::Request {
            target,
            duration,
            source_ip,
        } => {
            let grant = manager.request(target, source_ip, *duration).await?;
            if grant.tunnel.is_pending() {
                warn!(
                    "Tunnel for session {} is not answering yet; it may need a few more seconds",
                    grant.session.id
                );
            }
            info!("✅ Session {} ready at {}", grant.session.id, grant.public_url);
            to_value(&grant)
        }
        Command::Close { session } => to_value(&manager.close(session).await?),
        Command::Status { target } => to_value(&manager.status(target).await?),
        Command::List => to_value(&manager.list().await?),
        Command::Create {
            session,
            port,
            target,
        } => {
            let provisioned = manager.provision_route(session, *port, target).await?;
            Ok(json!({
                "session_id": provisioned.session_id,
                "route": provisioned.route,
                "public_url": provisioned.public_url,
                "fragment": provisioned.fragment_path,
                "changed": provisioned.changed,
            }))
        }
        Command::Remove { session } => {
            let removed = manager.remove_route(session).await?;
            Ok(json!({
                "session_id": session,
                "removed": removed == DeprovisionResult::Removed,
            }))
        }
        Command::Cleanup { .. } => to_value(&manager.cleanup().await?),
        Command::Migrate => Ok(json!({ "migrated": true })),
    }
}

async fn cleanup_loop(manager: &SessionManager, every: Duration) -> Result<Value, Failure> {
    info!("🧹 Sweeping every {}s (Ctrl+C to stop)", every.as_secs());

    let mut ticker = tokio::time::interval(every);
    let mut sweeps = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping cleanup loop");
                break;
            }
        }

        sweeps += 1;
        match manager.cleanup().await {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to encode sweep report: {}", e),
            },
            // A failed sweep is retried on the next tick
            Err(e) => error!("Sweep {} failed: {}", sweeps, e),
        }
    }

    Ok(json!({ "sweeps": sweeps }))
}
