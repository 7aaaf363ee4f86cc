//! Runtime tunables, loaded from JSON. Missing fields take defaults.

use crate::vpn::types::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Unix socket the engine connects its management interface to.
    pub management_socket: PathBuf,
    pub bind_retries: u32,
    pub bind_retry_delay_ms: u64,
    /// Interval requested with `bytecount` after each hold release.
    pub bytecount_interval_secs: u64,
    /// Debounce before a lost network pauses the tunnel.
    pub disconnect_wait_secs: u64,
    pub traffic_window_secs: u64,
    pub traffic_limit_bytes: u64,
    pub release_throttle_window_ms: u64,
    pub release_throttle_delay_ms: u64,
    /// Re-establish the tunnel when the network changes.
    pub netchange_reconnect: bool,
    /// Pause while the screen is off and traffic is low.
    pub screen_off_pause: bool,
    pub use_system_proxy: bool,
    /// Log password commands unredacted.
    pub debug_commands: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            management_socket: std::env::temp_dir().join("vpnlink-mgmt.sock"),
            bind_retries: 8,
            bind_retry_delay_ms: 300,
            bytecount_interval_secs: 2,
            disconnect_wait_secs: 20,
            traffic_window_secs: 60,
            traffic_limit_bytes: 64 * 1024,
            release_throttle_window_ms: 5000,
            release_throttle_delay_ms: 2000,
            netchange_reconnect: true,
            screen_off_pause: false,
            use_system_proxy: true,
            debug_commands: false,
        }
    }
}

impl CoreSettings {
    pub fn load(path: &Path) -> Result<Self, VpnError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VpnError::new(
                VpnErrorKind::Settings,
                format!("Failed to read settings {}", path.display()),
            )
            .with_detail(e.to_string())
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, VpnError> {
        let settings: Self = serde_json::from_str(text).map_err(|e| {
            VpnError::new(VpnErrorKind::Settings, "Failed to parse settings")
                .with_detail(e.to_string())
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), VpnError> {
        let nonzero = [
            ("bind_retries", self.bind_retries as u64),
            ("bind_retry_delay_ms", self.bind_retry_delay_ms),
            ("bytecount_interval_secs", self.bytecount_interval_secs),
            ("disconnect_wait_secs", self.disconnect_wait_secs),
            ("traffic_window_secs", self.traffic_window_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(VpnError::new(
                    VpnErrorKind::Settings,
                    format!("{} must be greater than zero", name),
                ));
            }
        }
        Ok(())
    }

    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_delay_ms)
    }

    pub fn disconnect_wait(&self) -> Duration {
        Duration::from_secs(self.disconnect_wait_secs)
    }

    pub fn traffic_window(&self) -> Duration {
        Duration::from_secs(self.traffic_window_secs)
    }

    pub fn release_throttle_window(&self) -> Duration {
        Duration::from_millis(self.release_throttle_window_ms)
    }

    pub fn release_throttle_delay(&self) -> Duration {
        Duration::from_millis(self.release_throttle_delay_ms)
    }
}
