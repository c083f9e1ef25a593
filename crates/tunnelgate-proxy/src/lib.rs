//! Reverse-proxy route provisioning for tunnel sessions
//!
//! Each session gets one nginx fragment that forwards an externally reachable path
//! (or paired public port) to the tunnel's loopback port. Fragments are aggregated
//! into a single include file, and every change goes through validate-before-activate:
//! the candidate configuration is checked by the proxy before it is asked to reload,
//! and the previous files are restored byte-for-byte if either step fails.

pub mod config;
pub mod lock;
pub mod model;
pub mod provisioner;
pub mod runner;

pub use config::{ProxyConfig, RouteMode, UpstreamScheme};
pub use lock::ConfigLock;
pub use model::{Directive, Exposure, ModelError, SessionRoute};
pub use provisioner::{DeprovisionResult, ProvisionError, ProvisionResult, ProxyProvisioner};
pub use runner::{CommandOutput, CommandRunner, SystemCommandRunner};
