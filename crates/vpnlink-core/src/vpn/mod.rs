//! VPN core module root – re-exports the public API surface.

pub mod types;
pub mod cidr;
pub mod profile;
pub mod config;
pub mod convert;
pub mod settings;
pub mod logging;
pub mod tunnel;
pub mod status;
pub mod auth;
pub mod routing;
pub mod platform;
pub mod management;
pub mod pause;
pub mod service;

pub use types::*;
pub use service::{ActiveSession, SessionRegistry, VpnService};
pub use status::StatusHub;
