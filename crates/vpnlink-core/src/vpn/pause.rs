//! Connectivity pause control.
//!
//! Three independent signals (network, screen, user) decide whether the
//! tunnel should run. Transitions of those signals turn into pause,
//! resume and network-change requests on the running session.

use crate::vpn::management::{PausedStateCallback, VpnControl};
use crate::vpn::settings::CoreSettings;
use crate::vpn::status::{ByteCountListener, StatusHub};
use crate::vpn::types::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The three connectivity signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseSignals {
    pub network: ConnectState,
    pub screen: ConnectState,
    pub user: ConnectState,
}

impl Default for PauseSignals {
    fn default() -> Self {
        Self {
            network: ConnectState::Disconnected,
            screen: ConnectState::ShouldBeConnected,
            user: ConnectState::ShouldBeConnected,
        }
    }
}

impl PauseSignals {
    pub fn should_be_connected(&self) -> bool {
        should_be_connected(self.network, self.screen, self.user)
    }

    pub fn pause_reason(&self) -> PauseReason {
        pause_reason_for(self.network, self.screen, self.user)
    }
}

/// All three signals must agree.
pub fn should_be_connected(network: ConnectState, screen: ConnectState, user: ConnectState) -> bool {
    [network, screen, user]
        .iter()
        .all(|s| *s == ConnectState::ShouldBeConnected)
}

/// User pause wins over screen off, which wins over lost network.
pub fn pause_reason_for(network: ConnectState, screen: ConnectState, user: ConnectState) -> PauseReason {
    if user == ConnectState::Disconnected {
        PauseReason::UserPause
    } else if screen == ConnectState::Disconnected {
        PauseReason::ScreenOff
    } else if network == ConnectState::Disconnected {
        PauseReason::NoNetwork
    } else {
        PauseReason::UserPause
    }
}

/// What the platform reports about the active network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Network type (`WIFI`, `MOBILE`, ...).
    pub kind: String,
    /// Type-specific identity, e.g. the SSID.
    pub extra: Option<String>,
    pub connected: bool,
}

impl NetworkInfo {
    pub fn same_network(&self, other: &NetworkInfo) -> bool {
        self.kind == other.kind && self.extra == other.extra
    }

    fn describe(&self) -> String {
        let state = if self.connected { "CONNECTED" } else { "DISCONNECTED" };
        format!("{} to {} {}", state, self.kind, self.extra.as_deref().unwrap_or("")).trim_end().to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Pause(PauseReason),
    Resume,
    NetworkChange(bool),
}

#[derive(Debug, Default)]
struct ControllerState {
    signals: PauseSignals,
    last_network: Option<NetworkInfo>,
    /// `(time, bytes)` samples while the screen is off.
    traffic: VecDeque<(Instant, u64)>,
    disconnect_timer: Option<JoinHandle<()>>,
    last_state_msg: Option<String>,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Turns device events into session control calls.
///
/// Decisions are made under the state lock; calls into the session are
/// made after it is released.
pub struct DeviceStateController {
    control: Arc<dyn VpnControl>,
    hub: Arc<StatusHub>,
    disconnect_wait: Duration,
    traffic_window: Duration,
    traffic_limit: u64,
    netchange_reconnect: bool,
    screen_off_pause: bool,
    state: StdMutex<ControllerState>,
    me: Weak<DeviceStateController>,
}

impl DeviceStateController {
    /// Build a controller for `control`, register it as the session's
    /// pause callback and as a traffic listener on `hub`.
    pub fn new(control: Arc<dyn VpnControl>, hub: Arc<StatusHub>, settings: &CoreSettings) -> Arc<Self> {
        let ctl = Arc::new_cyclic(|me| Self {
            control,
            hub,
            disconnect_wait: settings.disconnect_wait(),
            traffic_window: settings.traffic_window(),
            traffic_limit: settings.traffic_limit_bytes,
            netchange_reconnect: settings.netchange_reconnect,
            screen_off_pause: settings.screen_off_pause,
            state: StdMutex::new(ControllerState::default()),
            me: me.clone(),
        });

        let callback: Weak<dyn PausedStateCallback> = Arc::downgrade(&ctl) as Weak<dyn PausedStateCallback>;
        ctl.control.set_pause_callback(callback);
        let listener: Weak<dyn ByteCountListener> = Arc::downgrade(&ctl) as Weak<dyn ByteCountListener>;
        ctl.hub.add_byte_count_listener(listener);
        ctl
    }

    pub fn signals(&self) -> PauseSignals {
        lock(&self.state).signals
    }

    pub fn should_be_connected(&self) -> bool {
        self.signals().should_be_connected()
    }

    pub fn pause_reason(&self) -> PauseReason {
        self.signals().pause_reason()
    }

    pub fn is_user_paused(&self) -> bool {
        self.signals().user == ConnectState::Disconnected
    }

    pub fn has_pending_disconnect(&self) -> bool {
        lock(&self.state).disconnect_timer.is_some()
    }

    fn apply(&self, action: Option<Action>) {
        match action {
            Some(Action::Pause(reason)) => self.control.pause_vpn(reason),
            Some(Action::Resume) => self.control.resume_vpn(),
            Some(Action::NetworkChange(same)) => self.control.network_change(same),
            None => {}
        }
    }

    fn cancel_disconnect(st: &mut ControllerState) {
        if let Some(timer) = st.disconnect_timer.take() {
            timer.abort();
        }
    }

    // ── Network ──────────────────────────────────────────────────

    /// The active network changed. `None` means no network at all.
    pub fn network_state_change(&self, info: Option<NetworkInfo>) {
        let description = info
            .as_ref()
            .map(NetworkInfo::describe)
            .unwrap_or_else(|| "not connected".to_string());

        let action = {
            let mut st = lock(&self.state);
            let mut action = None;
            match info.as_ref().filter(|n| n.connected) {
                Some(net) => {
                    let pending = st.signals.network == ConnectState::PendingDisconnect;
                    st.signals.network = ConnectState::ShouldBeConnected;
                    let same = st
                        .last_network
                        .as_ref()
                        .is_some_and(|last| last.same_network(net));

                    if pending && same {
                        // Still the same network; sockets only need re-protecting.
                        Self::cancel_disconnect(&mut st);
                        action = Some(Action::NetworkChange(true));
                    } else {
                        if st.signals.screen == ConnectState::PendingDisconnect {
                            st.signals.screen = ConnectState::Disconnected;
                        }
                        if st.signals.should_be_connected() {
                            Self::cancel_disconnect(&mut st);
                            action = Some(if pending || !same {
                                Action::NetworkChange(same)
                            } else {
                                Action::Resume
                            });
                        }
                        st.last_network = Some(net.clone());
                    }
                }
                None if self.netchange_reconnect
                    && st.signals.network != ConnectState::Disconnected =>
                {
                    st.signals.network = ConnectState::PendingDisconnect;
                    self.schedule_disconnect(&mut st);
                }
                _ => {}
            }

            if st.last_state_msg.as_deref() != Some(description.as_str()) {
                self.hub.log_info(format!("Network status: {}", description));
            }
            self.hub.log_debug(format!(
                "Debug state info: {}, pause: {}, shouldbeconnected: {}, network: {}",
                description,
                st.signals.pause_reason(),
                st.signals.should_be_connected(),
                st.signals.network
            ));
            st.last_state_msg = Some(description);
            action
        };
        self.apply(action);
    }

    fn schedule_disconnect(&self, st: &mut ControllerState) {
        Self::cancel_disconnect(st);
        let me = self.me.clone();
        let wait = self.disconnect_wait;
        st.disconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(ctl) = me.upgrade() {
                ctl.delayed_disconnect();
            }
        }));
    }

    fn delayed_disconnect(&self) {
        let reason = {
            let mut st = lock(&self.state);
            st.disconnect_timer = None;
            if st.signals.network != ConnectState::PendingDisconnect {
                return;
            }
            st.signals.network = ConnectState::Disconnected;
            if st.signals.screen == ConnectState::PendingDisconnect {
                st.signals.screen = ConnectState::Disconnected;
            }
            st.signals.pause_reason()
        };
        self.control.pause_vpn(reason);
    }

    // ── Screen ───────────────────────────────────────────────────

    /// Screen turned off. Only acts when screen-off pausing is enabled.
    pub fn screen_off(&self) {
        if !self.screen_off_pause {
            return;
        }
        let mut st = lock(&self.state);
        st.signals.screen = ConnectState::PendingDisconnect;
        // Seed the window so a full window must pass before pausing.
        st.traffic.clear();
        st.traffic.push_back((Instant::now(), self.traffic_limit));
        if st.signals.network == ConnectState::Disconnected
            || st.signals.user == ConnectState::Disconnected
        {
            st.signals.screen = ConnectState::Disconnected;
        }
    }

    pub fn screen_on(&self) {
        let action = {
            let mut st = lock(&self.state);
            let was_connected = st.signals.should_be_connected();
            st.signals.screen = ConnectState::ShouldBeConnected;
            st.traffic.clear();
            Self::cancel_disconnect(&mut st);

            let now_connected = st.signals.should_be_connected();
            if now_connected != was_connected {
                Some(Action::Resume)
            } else if !now_connected {
                Some(Action::Pause(st.signals.pause_reason()))
            } else {
                None
            }
        };
        self.apply(action);
    }

    // ── User ─────────────────────────────────────────────────────

    pub fn set_user_pause(&self, pause: bool) {
        let action = {
            let mut st = lock(&self.state);
            if pause {
                st.signals.user = ConnectState::Disconnected;
                Some(Action::Pause(st.signals.pause_reason()))
            } else {
                let was_connected = st.signals.should_be_connected();
                st.signals.user = ConnectState::ShouldBeConnected;
                if st.signals.should_be_connected() && !was_connected {
                    Some(Action::Resume)
                } else if !st.signals.should_be_connected() {
                    Some(Action::Pause(st.signals.pause_reason()))
                } else {
                    None
                }
            }
        };
        self.apply(action);
    }
}

impl PausedStateCallback for DeviceStateController {
    fn should_be_running(&self) -> bool {
        self.should_be_connected()
    }
}

impl ByteCountListener for DeviceStateController {
    fn update_byte_count(&self, event: ByteCountEvent) {
        let action = {
            let mut st = lock(&self.state);
            if st.signals.screen != ConnectState::PendingDisconnect {
                return;
            }
            let now = Instant::now();
            st.traffic.push_back((now, event.diff_in + event.diff_out));
            while st
                .traffic
                .front()
                .is_some_and(|(t, _)| *t + self.traffic_window <= now)
            {
                st.traffic.pop_front();
            }

            let window_traffic: u64 = st.traffic.iter().map(|(_, bytes)| bytes).sum();
            if window_traffic >= self.traffic_limit {
                return;
            }
            self.hub.log_info(format!(
                "Screen off and less than {} kB traffic in {} s, pausing",
                self.traffic_limit / 1024,
                self.traffic_window.as_secs()
            ));
            st.signals.screen = ConnectState::Disconnected;
            Some(Action::Pause(st.signals.pause_reason()))
        };
        self.apply(action);
    }
}

impl Drop for DeviceStateController {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.state).disconnect_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectState::*;

    // ── Combinators ──────────────────────────────────────────────

    #[test]
    fn all_signals_must_agree() {
        assert!(should_be_connected(ShouldBeConnected, ShouldBeConnected, ShouldBeConnected));
        assert!(!should_be_connected(PendingDisconnect, ShouldBeConnected, ShouldBeConnected));
        assert!(!should_be_connected(ShouldBeConnected, Disconnected, ShouldBeConnected));
        assert!(!should_be_connected(ShouldBeConnected, ShouldBeConnected, Disconnected));
    }

    #[test]
    fn reason_precedence() {
        assert_eq!(pause_reason_for(Disconnected, Disconnected, Disconnected), PauseReason::UserPause);
        assert_eq!(pause_reason_for(Disconnected, Disconnected, ShouldBeConnected), PauseReason::ScreenOff);
        assert_eq!(pause_reason_for(Disconnected, ShouldBeConnected, ShouldBeConnected), PauseReason::NoNetwork);
        assert_eq!(pause_reason_for(PendingDisconnect, PendingDisconnect, ShouldBeConnected), PauseReason::UserPause);
    }

    // ── Test double ──────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingControl {
        calls: StdMutex<Vec<String>>,
        callback: StdMutex<Option<Weak<dyn PausedStateCallback>>>,
    }

    impl RecordingControl {
        fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }
    }

    impl VpnControl for RecordingControl {
        fn pause_vpn(&self, reason: PauseReason) {
            lock(&self.calls).push(format!("pause {}", reason));
        }
        fn resume_vpn(&self) {
            lock(&self.calls).push("resume".into());
        }
        fn network_change(&self, same_network: bool) {
            lock(&self.calls).push(format!("network_change {}", same_network));
        }
        fn send_cr_response(&self, _: &str) {}
        fn stop_vpn(&self) -> bool {
            true
        }
        fn set_pause_callback(&self, callback: Weak<dyn PausedStateCallback>) {
            *lock(&self.callback) = Some(callback);
        }
    }

    fn wifi(ssid: &str) -> Option<NetworkInfo> {
        Some(NetworkInfo {
            kind: "WIFI".into(),
            extra: Some(ssid.into()),
            connected: true,
        })
    }

    fn setup(settings: CoreSettings) -> (Arc<RecordingControl>, Arc<StatusHub>, Arc<DeviceStateController>) {
        let control = Arc::new(RecordingControl::default());
        let hub = StatusHub::new();
        let ctl = DeviceStateController::new(control.clone(), hub.clone(), &settings);
        (control, hub, ctl)
    }

    fn connected(settings: CoreSettings) -> (Arc<RecordingControl>, Arc<StatusHub>, Arc<DeviceStateController>) {
        let (control, hub, ctl) = setup(settings);
        ctl.network_state_change(wifi("home"));
        lock(&control.calls).clear();
        (control, hub, ctl)
    }

    // ── Wiring ───────────────────────────────────────────────────

    #[tokio::test]
    async fn registers_as_pause_callback() {
        let (control, _hub, ctl) = setup(CoreSettings::default());
        let cb = lock(&control.callback).as_ref().and_then(Weak::upgrade).unwrap();
        assert!(!cb.should_be_running());
        ctl.network_state_change(wifi("home"));
        assert!(cb.should_be_running());
        assert_eq!(control.calls(), vec!["network_change false"]);
    }

    // ── Network ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn same_network_return_within_debounce() {
        let (control, hub, ctl) = connected(CoreSettings::default());
        let before = hub.last_status();

        ctl.network_state_change(None);
        assert_eq!(ctl.signals().network, PendingDisconnect);
        tokio::time::sleep(Duration::from_secs(5)).await;
        ctl.network_state_change(wifi("home"));
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(control.calls(), vec!["network_change true"]);
        assert!(!ctl.has_pending_disconnect());
        assert_eq!(hub.last_status().state, before.state);
    }

    #[tokio::test(start_paused = true)]
    async fn network_loss_pauses_after_debounce() {
        let (control, _hub, ctl) = connected(CoreSettings::default());
        ctl.network_state_change(None);
        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(control.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(control.calls(), vec!["pause NONETWORK"]);
        assert_eq!(ctl.signals().network, Disconnected);
        assert!(!ctl.should_be_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn different_network_rebinds() {
        let (control, _hub, ctl) = connected(CoreSettings::default());
        ctl.network_state_change(None);
        ctl.network_state_change(wifi("office"));
        assert_eq!(control.calls(), vec!["network_change false"]);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(control.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn return_after_pause_resumes_engine() {
        let (control, _hub, ctl) = connected(CoreSettings::default());
        ctl.network_state_change(None);
        tokio::time::sleep(Duration::from_secs(21)).await;
        ctl.network_state_change(wifi("home"));
        assert_eq!(control.calls(), vec!["pause NONETWORK", "resume"]);
    }

    #[tokio::test]
    async fn loss_ignored_without_netchange_reconnect() {
        let settings = CoreSettings {
            netchange_reconnect: false,
            ..Default::default()
        };
        let (control, _hub, ctl) = connected(settings);
        ctl.network_state_change(None);
        assert_eq!(ctl.signals().network, ShouldBeConnected);
        assert!(control.calls().is_empty());
    }

    // ── User ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn user_pause_and_resume() {
        let (control, _hub, ctl) = connected(CoreSettings::default());
        ctl.set_user_pause(true);
        assert!(ctl.is_user_paused());
        ctl.set_user_pause(false);
        assert_eq!(control.calls(), vec!["pause USERPAUSE", "resume"]);

        // Redundant unpause does nothing.
        ctl.set_user_pause(false);
        assert_eq!(control.calls().len(), 2);
    }

    #[tokio::test]
    async fn unpause_without_network_republishes_reason() {
        let (control, _hub, ctl) = setup(CoreSettings::default());
        ctl.set_user_pause(true);
        ctl.set_user_pause(false);
        assert_eq!(control.calls(), vec!["pause USERPAUSE", "pause NONETWORK"]);
    }

    // ── Screen ───────────────────────────────────────────────────

    fn screen_settings() -> CoreSettings {
        CoreSettings {
            screen_off_pause: true,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn screen_off_with_idle_traffic_pauses() {
        let (control, hub, ctl) = connected(screen_settings());
        ctl.screen_off();
        assert_eq!(ctl.signals().screen, PendingDisconnect);

        hub.update_byte_count(100, 100);
        assert!(control.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        hub.update_byte_count(200, 200);
        assert_eq!(control.calls(), vec!["pause SCREENOFF"]);

        ctl.screen_on();
        assert_eq!(control.calls(), vec!["pause SCREENOFF", "resume"]);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_screen_off_keeps_running() {
        let (control, hub, ctl) = connected(screen_settings());
        ctl.screen_off();
        tokio::time::sleep(Duration::from_secs(61)).await;
        hub.update_byte_count(1 << 20, 1 << 20);
        assert!(control.calls().is_empty());
        assert_eq!(ctl.signals().screen, PendingDisconnect);
    }

    #[tokio::test]
    async fn screen_off_disabled_by_default() {
        let (_control, _hub, ctl) = connected(CoreSettings::default());
        ctl.screen_off();
        assert_eq!(ctl.signals().screen, ShouldBeConnected);
    }

    #[tokio::test]
    async fn screen_on_while_user_paused_republishes() {
        let (control, _hub, ctl) = connected(screen_settings());
        ctl.set_user_pause(true);
        ctl.screen_off();
        assert_eq!(ctl.signals().screen, Disconnected);
        ctl.screen_on();
        assert_eq!(control.calls(), vec!["pause USERPAUSE", "pause USERPAUSE"]);
    }
}
