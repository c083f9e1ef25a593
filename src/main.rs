//! Tunnelgate - ephemeral remote access to firewall web UIs

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnelgate_cli::Cli;

#[tokio::main]
async fn main() {
    let matches = Cli::command()
        .version(env!("GIT_TAG"))
        .long_version(concat!(
            env!("GIT_TAG"),
            "\nCommit: ",
            env!("GIT_HASH"),
            "\nBuilt: ",
            env!("BUILD_TIME")
        ))
        .get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    let code = tunnelgate_cli::execute(cli).await;
    std::process::exit(code);
}

/// Logs go to stderr; stdout carries the JSON result
fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Invalid log level")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
