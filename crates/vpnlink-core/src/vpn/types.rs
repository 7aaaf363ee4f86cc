//! Shared types, enums, error types, and status payloads for the VPN core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Marker prefix for file content embedded directly in a profile field.
pub const INLINE_TAG: &str = "[[INLINE]]";

/// Placeholder DNS slot values used until a `dhcp-option DNS` fills them.
pub const DEFAULT_DNS1: &str = "202.96.209.5";
pub const DEFAULT_DNS2: &str = "8.8.8.8";

/// Name given to profiles produced by the config parser.
pub const CONVERTED_PROFILE: &str = "converted Profile";

/// Default `mssfix` value when the option carries no argument.
pub const DEFAULT_MSSFIX: u32 = 1450;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection levels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed set of user-visible connection levels.
///
/// Every engine state name and every internal status name maps onto
/// exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionLevel {
    Connected,
    VpnPaused,
    ConnectingServerReplied,
    ConnectingNoServerReply,
    NoNetwork,
    NotConnected,
    Start,
    WaitingForUserInput,
    GeneralError,
    AuthFailed,
    Unknown,
}

impl Default for ConnectionLevel {
    fn default() -> Self {
        Self::NotConnected
    }
}

impl ConnectionLevel {
    /// Stable numeric code, shared with front-ends that persist levels.
    pub fn code(self) -> u8 {
        match self {
            Self::Connected => 1,
            Self::VpnPaused => 2,
            Self::ConnectingServerReplied => 3,
            Self::ConnectingNoServerReply => 4,
            Self::NoNetwork => 5,
            Self::NotConnected => 6,
            Self::Start => 7,
            Self::WaitingForUserInput => 8,
            Self::GeneralError => 9,
            Self::AuthFailed => 10,
            Self::Unknown => 11,
        }
    }

    /// Map an engine state name (or an internal status name) to a level.
    pub fn from_state(state: &str) -> Self {
        match state {
            "CONNECTING" | "WAIT" | "RECONNECTING" | "RESOLVE" | "TCP_CONNECT"
            | "CONNECTRETRY" => Self::ConnectingNoServerReply,
            "AUTH" | "GET_CONFIG" | "ASSIGN_IP" | "ADD_ROUTES" | "AUTH_PENDING" => {
                Self::ConnectingServerReplied
            }
            "CONNECTED" => Self::Connected,
            "DISCONNECTED"
            | "EXITING"
            | "NOPROCESS"
            | "USER_VPN_PASSWORD_CANCELLED"
            | "USER_VPN_PERMISSION_CANCELLED" => Self::NotConnected,
            "USER_VPN_PERMISSION" | "USER_VPN_PASSWORD" | "NEED" | "USER_INPUT" => {
                Self::WaitingForUserInput
            }
            "NONETWORK" => Self::NoNetwork,
            "SCREENOFF" | "USERPAUSE" => Self::VpnPaused,
            "VPN_GENERATE_CONFIG" => Self::Start,
            "GENERAL_ERROR" => Self::GeneralError,
            "AUTH_FAILED" => Self::AuthFailed,
            _ => Self::Unknown,
        }
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::VpnPaused => write!(f, "Paused"),
            Self::ConnectingServerReplied => write!(f, "Connecting (server replied)"),
            Self::ConnectingNoServerReply => write!(f, "Connecting"),
            Self::NoNetwork => write!(f, "No network"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Start => write!(f, "Starting"),
            Self::WaitingForUserInput => write!(f, "Waiting for user input"),
            Self::GeneralError => write!(f, "Error"),
            Self::AuthFailed => write!(f, "Authentication failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Pause signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why the tunnel is (or would be) paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    NoNetwork,
    UserPause,
    ScreenOff,
}

impl Default for PauseReason {
    fn default() -> Self {
        Self::NoNetwork
    }
}

impl PauseReason {
    /// Status name published for this reason.
    pub fn state_name(self) -> &'static str {
        match self {
            Self::NoNetwork => "NONETWORK",
            Self::UserPause => "USERPAUSE",
            Self::ScreenOff => "SCREENOFF",
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// One connectivity signal (network, screen or user).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectState {
    ShouldBeConnected,
    PendingDisconnect,
    Disconnected,
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShouldBeConnected => write!(f, "SHOULDBECONNECTED"),
            Self::PendingDisconnect => write!(f, "PENDINGDISCONNECT"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Profile enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Proxy kind configured on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    None,
    Http,
    Socks5,
}

impl Default for ProxyType {
    fn default() -> Self {
        Self::None
    }
}

impl ProxyType {
    /// Token used in `proxy ...` management replies.
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Http => "HTTP",
            Self::Socks5 => "SOCKS5",
        }
    }
}

/// How the client authenticates against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    UserPassPkcs12,
    UserPassKeystore,
    Pkcs12,
    Keystore,
    UserPass,
}

impl Default for AuthType {
    fn default() -> Self {
        Self::UserPassPkcs12
    }
}

impl AuthType {
    pub fn uses_keystore(self) -> bool {
        matches!(self, Self::Keystore | Self::UserPassKeystore)
    }

    pub fn uses_pkcs12(self) -> bool {
        matches!(self, Self::Pkcs12 | Self::UserPassPkcs12)
    }

    pub fn uses_password(self) -> bool {
        matches!(
            self,
            Self::UserPass | Self::UserPassPkcs12 | Self::UserPassKeystore
        )
    }
}

/// Certificate name matching mode (`tls-remote` / `verify-x509-name`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum X509VerifyMode {
    /// Legacy `tls-remote` exact match.
    TlsRemote,
    /// Legacy `tls-remote` with `compat-names no-remapping`.
    TlsRemoteCompatNoRemapping,
    Dn,
    Rdn,
    RdnPrefix,
}

impl Default for X509VerifyMode {
    fn default() -> Self {
        Self::Rdn
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Status payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Negotiated tunnel metadata captured when the tunnel comes up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSnapshot {
    pub tls_version: Option<String>,
    pub tls_cipher: Option<String>,
    pub cipher: Option<String>,
    pub auth: Option<String>,
    pub vpn_gateway_v4: Option<String>,
    pub vpn_gateway_v6: Option<String>,
    pub established_time: Option<DateTime<Utc>>,
}

/// One published status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Engine or internal state name (`CONNECTED`, `NONETWORK`, ...).
    pub state: String,
    pub message: String,
    pub level: ConnectionLevel,
    pub tunnel: Option<TunnelSnapshot>,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(state: impl Into<String>, message: impl Into<String>) -> Self {
        let state = state.into();
        Self {
            level: ConnectionLevel::from_state(&state),
            state,
            message: message.into(),
            tunnel: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_tunnel(mut self, tunnel: TunnelSnapshot) -> Self {
        self.tunnel = Some(tunnel);
        self
    }
}

/// Cumulative counters plus the delta since the previous sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCountEvent {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub diff_in: u64,
    pub diff_out: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpnErrorKind {
    ConfigParse,
    InvalidProfile,
    Bind,
    Io,
    Credential,
    Signing,
    TunnelUnavailable,
    Settings,
    Protocol,
}

/// Crate-level error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnError {
    pub kind: VpnErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for VpnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(d) = &self.detail {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for VpnError {}

impl VpnError {
    pub fn new(kind: VpnErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
        }
    }

    /// Shorthand for configuration parse failures.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::ConfigParse, msg)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<VpnError> for String {
    fn from(e: VpnError) -> String {
        e.to_string()
    }
}

impl From<std::io::Error> for VpnError {
    fn from(e: std::io::Error) -> Self {
        VpnError::new(VpnErrorKind::Io, e.to_string())
    }
}
