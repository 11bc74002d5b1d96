//! onedoor: SOCKS5, HTTP proxy and TLS admin traffic on a single port.
//!
//! The public listener ([`mux`]) routes each connection by its first bytes
//! to one of three loopback backends ([`backend`]). The SOCKS and HTTP
//! backends share one [`Whitelist`] through [`access`]; the admin backend
//! edits it. [`startup`] brings the backends up before the public port.
//!
//! An empty whitelist allows every client.

pub mod access;
pub mod backend;
pub mod config;
pub mod error;
pub mod mux;
pub mod proxy_protocol;
pub mod relay;
pub mod startup;

pub use access::{Access, AccessControl};
pub use backend::{BackendConfig, BackendDescriptor, BackendRole};
pub use config::Cli;
pub use error::StartupError;
pub use mux::{Classifier, MuxConfig, MuxListener};
pub use onedoor_whitelist::Whitelist;
pub use startup::{FrontDoor, FrontDoorConfig};
