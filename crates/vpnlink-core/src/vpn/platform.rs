//! Host capabilities the core calls out to: key signing, tunnel
//! interfaces, user prompts and proxy discovery.
//!
//! Each capability is a trait object so the embedding runtime can plug
//! in its own implementation. [`Platform::headless`] wires up inert
//! defaults that refuse or ignore every request.

use crate::vpn::auth::{CredentialKind, CredentialProvider, PasswordCache};
use crate::vpn::profile::Connection;
use crate::vpn::routing::TunConfig;
use crate::vpn::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Signing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Padding requested by a `>PK_SIGN:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignPadding {
    /// `RSA_PKCS1_PADDING`, also assumed when the engine names none.
    Pkcs1,
    /// Raw signature; the engine has already padded the input.
    None,
}

impl SignPadding {
    pub fn from_wire(mode: Option<&str>) -> Self {
        match mode {
            None | Some("RSA_PKCS1_PADDING") => Self::Pkcs1,
            Some(_) => Self::None,
        }
    }
}

/// Signs with a key held outside the process. EC keys ignore padding.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(
        &self,
        alias: &str,
        data: &[u8],
        padding: SignPadding,
    ) -> Result<Vec<u8>, VpnError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tunnel interface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An opened tunnel interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunHandle {
    pub fd: i32,
}

#[async_trait]
pub trait TunnelFactory: Send + Sync {
    /// Open the interface for `config` and queue its descriptor for
    /// transfer with the next line written on the control channel.
    async fn open_tun(&self, config: &TunConfig) -> Result<TunHandle, VpnError>;

    /// Exempt the socket the engine just passed us from the tunnel.
    fn protect_pending_socket(&self) -> bool;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Prompts and proxies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Surfaces prompts to the user.
pub trait Notifier: Send + Sync {
    /// The engine needs a secret the core does not have.
    fn request_input(&self, kind: CredentialKind);
    /// Single sign-on or challenge text (`OPEN_URL:...`, `CR_TEXT:...`).
    fn sso_prompt(&self, info: &str);
}

/// System proxy lookup for connections without a static proxy.
#[async_trait]
pub trait ProxyDetector: Send + Sync {
    /// `(host, port)` of the HTTP proxy to use for `conn`, if any.
    async fn detect(&self, conn: &Connection) -> Option<(String, String)>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Bundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All host capabilities, cheap to clone into each session.
#[derive(Clone)]
pub struct Platform {
    pub signer: Arc<dyn Signer>,
    pub tunnels: Arc<dyn TunnelFactory>,
    pub notifier: Arc<dyn Notifier>,
    pub proxies: Arc<dyn ProxyDetector>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl Platform {
    /// No signing key, no tunnel device, prompts only logged, no system
    /// proxy, and an empty password cache.
    pub fn headless() -> Self {
        Self {
            signer: Arc::new(Headless),
            tunnels: Arc::new(Headless),
            notifier: Arc::new(Headless),
            proxies: Arc::new(Headless),
            credentials: Arc::new(PasswordCache::new()),
        }
    }
}

struct Headless;

#[async_trait]
impl Signer for Headless {
    async fn sign(&self, alias: &str, _: &[u8], _: SignPadding) -> Result<Vec<u8>, VpnError> {
        Err(VpnError::new(
            VpnErrorKind::Signing,
            format!("no key store available for alias {}", alias),
        ))
    }
}

#[async_trait]
impl TunnelFactory for Headless {
    async fn open_tun(&self, _: &TunConfig) -> Result<TunHandle, VpnError> {
        Err(VpnError::new(
            VpnErrorKind::TunnelUnavailable,
            "no tunnel device on this platform",
        ))
    }

    fn protect_pending_socket(&self) -> bool {
        false
    }
}

impl Notifier for Headless {
    fn request_input(&self, kind: CredentialKind) {
        log::warn!("input requested for {} but no prompt is available", kind);
    }

    fn sso_prompt(&self, info: &str) {
        log::warn!("sso prompt dropped: {}", info);
    }
}

#[async_trait]
impl ProxyDetector for Headless {
    async fn detect(&self, _: &Connection) -> Option<(String, String)> {
        None
    }
}
