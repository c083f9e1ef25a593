//! Tunnelgate command-line interface
//!
//! Thin layer over [`tunnelgate_control::SessionManager`]: parses arguments,
//! loads configuration, runs one verb and reports the outcome as JSON.

pub mod cli;
pub mod commands;
pub mod config;

pub use cli::{parse_duration, Cli, Command};
pub use commands::{dispatch, execute, Failure};
pub use config::AppConfig;
