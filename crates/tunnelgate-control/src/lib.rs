//! Tunnel session control
//!
//! Coordinates the durable session registry with the resources derived from it:
//! a loopback port, an SSH tunnel process, a firewall grant and a reverse-proxy
//! route. [`SessionManager`] runs the short request path; [`ExpiryReaper`]
//! reconciles everything on a schedule.

pub mod allocator;
pub mod config;
pub mod error;
pub mod grant;
pub mod manager;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod tunnel;

pub use allocator::PortAllocator;
pub use config::{GrantConfig, GrantStrategy, ManagerConfig, PortPool, SessionConfig, TunnelConfig};
pub use error::TunnelError;
pub use grant::{
    AccessGrant, AccessGrantCoordinator, EphemeralRuleGrant, GrantResult, PermanentGrant,
};
pub use manager::{CloseResult, SessionGrant, SessionManager, SessionView, TargetStatus};
pub use process::{
    PortProbe, ProcessInspector, SystemPortProbe, SystemProcessInspector, TunnelProcess,
};
pub use reaper::{evaluate, ExpiryPolicy, ExpiryReaper, ReclaimReason, ReclaimedSession, SweepReport};
pub use registry::{DbFirewallRegistry, FirewallEndpoint, FirewallRegistry};
pub use tunnel::{ssh_command, StartResult, TunnelProcessManager};
