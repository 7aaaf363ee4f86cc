//! Credential lookup for engine password prompts.

use crate::vpn::profile::{Connection, Profile};
use crate::vpn::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex as StdMutex;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Credential kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the engine is asking for, named as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    PrivateKey,
    Auth,
    HttpProxy,
}

impl CredentialKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::PrivateKey => "Private Key",
            Self::Auth => "Auth",
            Self::HttpProxy => "HTTP Proxy",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "Private Key" => Some(Self::PrivateKey),
            "Auth" => Some(Self::Auth),
            "HTTP Proxy" => Some(Self::HttpProxy),
            _ => None,
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Provider seam + in-memory cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Secrets entered by the user ahead of an engine prompt.
pub trait CredentialProvider: Send + Sync {
    /// Return and forget the cached secret.
    fn take(&self, profile: &Uuid, kind: CredentialKind) -> Option<String>;
    fn store(&self, profile: &Uuid, kind: CredentialKind, secret: String);
    fn clear(&self, profile: &Uuid);
}

#[derive(Debug, Default)]
struct CachedSecrets {
    protect_password: Option<String>,
    auth_password: Option<String>,
}

/// Per-profile cache with a private-key slot and an auth slot.
#[derive(Debug, Default)]
pub struct PasswordCache {
    slots: StdMutex<HashMap<Uuid, CachedSecrets>>,
}

impl PasswordCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialProvider for PasswordCache {
    fn take(&self, profile: &Uuid, kind: CredentialKind) -> Option<String> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        let entry = slots.get_mut(profile)?;
        match kind {
            CredentialKind::PrivateKey => entry.protect_password.take(),
            CredentialKind::Auth => entry.auth_password.take(),
            CredentialKind::HttpProxy => None,
        }
    }

    fn store(&self, profile: &Uuid, kind: CredentialKind, secret: String) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        let entry = slots.entry(*profile).or_default();
        match kind {
            CredentialKind::PrivateKey => entry.protect_password = Some(secret),
            CredentialKind::Auth => entry.auth_password = Some(secret),
            CredentialKind::HttpProxy => {
                log::debug!("proxy credentials are not cached");
            }
        }
    }

    fn clear(&self, profile: &Uuid) {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(profile);
    }
}

/// Username (if the kind has one) and secret to answer a prompt with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialAnswer {
    pub username: Option<String>,
    pub password: String,
}

/// Resolve a prompt from the cache, then the profile. `proxy` is the
/// connection whose proxy the engine last asked about.
pub fn resolve_credentials(
    profile: &Profile,
    kind: CredentialKind,
    provider: &dyn CredentialProvider,
    proxy: Option<&Connection>,
) -> Option<CredentialAnswer> {
    match kind {
        CredentialKind::PrivateKey => {
            let password = provider.take(&profile.uuid, kind).or_else(|| {
                profile
                    .authentication_type
                    .uses_pkcs12()
                    .then(|| profile.protect_password.clone())
                    .flatten()
            })?;
            Some(CredentialAnswer {
                username: None,
                password,
            })
        }
        CredentialKind::Auth => {
            let password = provider
                .take(&profile.uuid, kind)
                .or_else(|| profile.password.clone())?;
            Some(CredentialAnswer {
                username: profile.username.clone(),
                password,
            })
        }
        CredentialKind::HttpProxy => {
            let conn = proxy?;
            Some(CredentialAnswer {
                username: conn.proxy_auth_username.clone(),
                password: conn.proxy_auth_password.clone()?,
            })
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  >PASSWORD: parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A decoded `>PASSWORD:` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordNotice {
    /// `Auth-Token:` is handled by the engine itself.
    AuthToken,
    /// `Need '<kind>' ...`; the raw name is kept for the reply.
    Need(String),
    /// `Verification Failed: '<kind>' ['reason']`.
    VerificationFailed { needed: String, reason: String },
}

/// Decode a `>PASSWORD:` argument.
pub fn parse_password_notice(arg: &str) -> Result<PasswordNotice, VpnError> {
    if arg.starts_with("Auth-Token:") {
        return Ok(PasswordNotice::AuthToken);
    }
    let bad = || {
        VpnError::new(
            VpnErrorKind::Protocol,
            format!("Could not parse management Password command: {}", arg),
        )
    };
    let p1 = arg.find('\'').ok_or_else(bad)?;
    let p2 = arg[p1 + 1..].find('\'').map(|i| p1 + 1 + i).ok_or_else(bad)?;
    let needed = arg[p1 + 1..p2].to_string();

    if arg.starts_with("Verification Failed") {
        let reason = parse_auth_failure(&needed, &arg[p2 + 1..]);
        return Ok(PasswordNotice::VerificationFailed { needed, reason });
    }
    Ok(PasswordNotice::Need(needed))
}

/// Reason text for a failed verification.
///
/// The bracketed `['...']` detail is split on whitespace and its first two
/// words are used; otherwise the raw text is kept.
pub fn parse_auth_failure(needed: &str, rest: &str) -> String {
    let detail = match (rest.find("['"), rest.find("']")) {
        (Some(start), Some(end)) if end >= start + 2 => &rest[start + 2..end],
        _ => rest,
    };
    let parts: Vec<&str> = detail.split_whitespace().collect();
    if parts.len() >= 2 {
        format!("{} {}", parts[0], parts[1])
    } else {
        format!("{}{}", needed, rest)
    }
}
