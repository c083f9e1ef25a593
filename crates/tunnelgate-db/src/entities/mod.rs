//! Database entities

pub mod firewall;
pub mod grant_request;
pub mod tunnel_session;

pub use firewall::Entity as Firewall;
pub use grant_request::Entity as GrantRequest;
pub use tunnel_session::Entity as TunnelSession;

pub mod prelude {
    pub use super::firewall::Entity as Firewall;
    pub use super::grant_request::Entity as GrantRequest;
    pub use super::tunnel_session::Entity as TunnelSession;
}
