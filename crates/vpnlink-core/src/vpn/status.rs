//! Status hub: last published status, per-source log buffers, traffic
//! history and fan-out to subscribers.
//!
//! Constructed once per process and shared as `Arc<StatusHub>`. Each
//! logical resource sits behind its own lock; nothing here holds two
//! locks at once.

use crate::vpn::logging::{
    engine_error_hint, parse_console_line, LogBuffer, LogEntry, LogLevel, LogSource,
};
use crate::vpn::tunnel::{TrafficHistory, TunnelInfoCollector};
use crate::vpn::types::*;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Receives every byte-count sample.
pub trait ByteCountListener: Send + Sync {
    fn update_byte_count(&self, event: ByteCountEvent);
}

/// Everything the hub publishes.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Status(StatusUpdate),
    Log(LogEntry),
    ByteCount(ByteCountEvent),
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct StatusHub {
    status: StdMutex<StatusUpdate>,
    connected_profile: StdMutex<Option<String>>,
    tunnel: StdMutex<TunnelInfoCollector>,
    logs: StdMutex<HashMap<LogSource, LogBuffer>>,
    traffic: StdMutex<TrafficHistory>,
    byte_listeners: StdMutex<Vec<Weak<dyn ByteCountListener>>>,
    events: broadcast::Sender<HubEvent>,
}

impl StatusHub {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            status: StdMutex::new(StatusUpdate::new("NOPROCESS", "")),
            connected_profile: StdMutex::new(None),
            tunnel: StdMutex::new(TunnelInfoCollector::new()),
            logs: StdMutex::new(HashMap::new()),
            traffic: StdMutex::new(TrafficHistory::default()),
            byte_listeners: StdMutex::new(Vec::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: HubEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Status ───────────────────────────────────────────────────

    pub fn last_status(&self) -> StatusUpdate {
        lock(&self.status).clone()
    }

    pub fn last_level(&self) -> ConnectionLevel {
        lock(&self.status).level
    }

    /// Anything but an error or not-connected level.
    pub fn is_vpn_active(&self) -> bool {
        !matches!(
            self.last_level(),
            ConnectionLevel::GeneralError | ConnectionLevel::AuthFailed | ConnectionLevel::NotConnected
        )
    }

    /// Publish a status change. Returns `false` when suppressed.
    ///
    /// `GET_CONFIG` is polling noise while waiting for user input, and the
    /// engine echoes `WAIT`/`AUTH` after it is already connected; both are
    /// dropped.
    pub fn update_status(&self, state: &str, message: &str) -> bool {
        let last = self.last_level();

        if last == ConnectionLevel::WaitingForUserInput && state == "GET_CONFIG" {
            return false;
        }
        if last == ConnectionLevel::Connected && (state == "WAIT" || state == "AUTH") {
            self.log(
                LogSource::Front,
                LogLevel::Debug,
                format!(
                    "Ignoring engine status in CONNECTED state ({}->{}): {}",
                    state,
                    ConnectionLevel::from_state(state),
                    message
                ),
            );
            return false;
        }

        let mut update = StatusUpdate::new(state, message);
        if update.level == ConnectionLevel::Connected {
            update = update.with_tunnel(lock(&self.tunnel).snapshot(Utc::now()));
        } else if update.level == ConnectionLevel::NotConnected {
            lock(&self.tunnel).clear();
        }

        log::info!("status {} ({}) {}", update.state, update.level, update.message);
        *lock(&self.status) = update.clone();
        self.publish(HubEvent::Status(update));
        true
    }

    pub fn update_status_pause(&self, reason: PauseReason) {
        self.update_status(reason.state_name(), "");
    }

    pub fn set_connected_profile(&self, uuid: Option<String>) {
        *lock(&self.connected_profile) = uuid;
    }

    pub fn connected_profile(&self) -> Option<String> {
        lock(&self.connected_profile).clone()
    }

    /// Whether `uuid` (or any profile when `None`) is connected.
    pub fn is_vpn_connected(&self, uuid: Option<&str>) -> bool {
        self.last_level() == ConnectionLevel::Connected
            && uuid.map_or(true, |u| self.connected_profile().as_deref() == Some(u))
    }

    // ── Engine output ────────────────────────────────────────────

    /// Feed an engine log line: collects tunnel metadata and maps known
    /// fatal messages to `GENERAL_ERROR`.
    pub fn observe_engine_log(&self, line: &str) {
        lock(&self.tunnel).observe(line);
        if let Some(hint) = engine_error_hint(line) {
            self.update_status("GENERAL_ERROR", hint);
        }
    }

    /// Feed one line of engine stdout into the console log.
    pub fn observe_console_line(&self, line: &str) {
        let entry = parse_console_line(line);
        self.observe_engine_log(&entry.message);
        self.log_entry(entry);
    }

    pub fn tunnel_snapshot(&self) -> TunnelSnapshot {
        lock(&self.tunnel).current().clone()
    }

    // ── Logs ─────────────────────────────────────────────────────

    pub fn log(&self, source: LogSource, level: LogLevel, message: impl Into<String>) {
        self.log_entry(LogEntry::new(source, level, message));
    }

    pub fn log_entry(&self, entry: LogEntry) {
        entry.level.emit(entry.source, &entry.message);
        lock(&self.logs)
            .entry(entry.source)
            .or_default()
            .push(entry.clone());
        self.publish(HubEvent::Log(entry));
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.log(LogSource::Front, LogLevel::Info, message);
    }

    pub fn log_warning(&self, message: impl Into<String>) {
        self.log(LogSource::Front, LogLevel::Warning, message);
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.log(LogSource::Front, LogLevel::Error, message);
    }

    pub fn log_debug(&self, message: impl Into<String>) {
        self.log(LogSource::Front, LogLevel::Debug, message);
    }

    /// Copy of one source's buffer, oldest first.
    pub fn logs(&self, source: LogSource) -> Vec<LogEntry> {
        lock(&self.logs)
            .get(&source)
            .map(|b| b.entries().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All sources merged by timestamp.
    pub fn all_logs(&self) -> Vec<LogEntry> {
        let mut all: Vec<LogEntry> = lock(&self.logs)
            .values()
            .flat_map(|b| b.entries().iter().cloned())
            .collect();
        all.sort_by_key(|e| e.timestamp);
        all
    }

    pub fn clear_logs(&self) {
        lock(&self.logs).clear();
    }

    // ── Traffic ──────────────────────────────────────────────────

    /// Register a listener; it immediately receives the latest sample.
    pub fn add_byte_count_listener(&self, listener: Weak<dyn ByteCountListener>) {
        let last = lock(&self.traffic).last_diff();
        if let Some(l) = listener.upgrade() {
            l.update_byte_count(last);
        }
        lock(&self.byte_listeners).push(listener);
    }

    pub fn update_byte_count(&self, bytes_in: u64, bytes_out: u64) -> ByteCountEvent {
        let event = lock(&self.traffic).add(bytes_in, bytes_out);

        let listeners: Vec<Arc<dyn ByteCountListener>> = {
            let mut guard = lock(&self.byte_listeners);
            guard.retain(|w| w.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for l in listeners {
            l.update_byte_count(event);
        }

        self.publish(HubEvent::ByteCount(event));
        event
    }

    pub fn last_byte_count(&self) -> ByteCountEvent {
        lock(&self.traffic).last_diff()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter(AtomicU64);

    impl ByteCountListener for Counter {
        fn update_byte_count(&self, event: ByteCountEvent) {
            self.0.fetch_add(event.diff_in, Ordering::SeqCst);
        }
    }

    // ── Status ───────────────────────────────────────────────────

    #[test]
    fn initial_status_is_noprocess() {
        let hub = StatusHub::new();
        assert_eq!(hub.last_status().state, "NOPROCESS");
        assert_eq!(hub.last_level(), ConnectionLevel::NotConnected);
        assert!(!hub.is_vpn_active());
    }

    #[test]
    fn wait_and_auth_ignored_while_connected() {
        let hub = StatusHub::new();
        assert!(hub.update_status("CONNECTED", "SUCCESS,10.8.0.2"));
        assert!(!hub.update_status("AUTH", ""));
        assert!(!hub.update_status("WAIT", ""));
        assert_eq!(hub.last_status().state, "CONNECTED");
        assert!(hub
            .logs(LogSource::Front)
            .iter()
            .any(|e| e.message.starts_with("Ignoring engine status in CONNECTED state (AUTH->")));
        assert!(hub.update_status("RECONNECTING", "ping-restart"));
        assert_eq!(hub.last_level(), ConnectionLevel::ConnectingNoServerReply);
    }

    #[test]
    fn get_config_ignored_while_waiting_for_input() {
        let hub = StatusHub::new();
        hub.update_status("NEED", "Auth");
        assert!(!hub.update_status("GET_CONFIG", ""));
        assert_eq!(hub.last_status().state, "NEED");
        hub.update_status("AUTH", "");
        assert!(hub.update_status("GET_CONFIG", ""));
    }

    #[test]
    fn pause_reason_published() {
        let hub = StatusHub::new();
        hub.update_status_pause(PauseReason::ScreenOff);
        assert_eq!(hub.last_status().state, "SCREENOFF");
        assert_eq!(hub.last_level(), ConnectionLevel::VpnPaused);
        assert!(hub.is_vpn_active());
    }

    #[test]
    fn connected_status_carries_tunnel() {
        let hub = StatusHub::new();
        hub.observe_engine_log("Control Channel: TLSv1.3, cipher TLSv1.3 TLS_AES_256_GCM_SHA384, 2048 bit RSA");
        hub.update_status("CONNECTED", "");
        let tunnel = hub.last_status().tunnel.unwrap();
        assert_eq!(tunnel.tls_version.as_deref(), Some("TLSv1.3"));
        assert!(tunnel.established_time.is_some());
    }

    #[test]
    fn engine_errors_become_general_error() {
        let hub = StatusHub::new();
        hub.observe_engine_log("TLS Error: TLS key negotiation failed to occur within 60 seconds");
        assert_eq!(hub.last_level(), ConnectionLevel::GeneralError);
    }

    #[test]
    fn console_lines_logged_and_observed() {
        let hub = StatusHub::new();
        hub.observe_console_line("1380308330.240114 10 Exiting due to fatal error");
        hub.observe_console_line("RESOLVE: Cannot resolve host address: vpn.invalid");

        let console = hub.logs(LogSource::Console);
        assert_eq!(console.len(), 2);
        assert_eq!(console[0].message, "Exiting due to fatal error");
        assert_eq!(hub.last_level(), ConnectionLevel::GeneralError);
        assert!(hub.logs(LogSource::Management).is_empty());
    }

    #[test]
    fn connected_profile_tracking() {
        let hub = StatusHub::new();
        hub.set_connected_profile(Some("abc".into()));
        hub.update_status("CONNECTED", "");
        assert!(hub.is_vpn_connected(None));
        assert!(hub.is_vpn_connected(Some("abc")));
        assert!(!hub.is_vpn_connected(Some("xyz")));
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let hub = StatusHub::new();
        let mut rx = hub.subscribe();
        hub.update_status("CONNECTING", "");
        hub.log_info("hello");
        match rx.recv().await.unwrap() {
            HubEvent::Status(s) => assert_eq!(s.state, "CONNECTING"),
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            HubEvent::Log(e) => assert_eq!(e.message, "hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    // ── Logs ─────────────────────────────────────────────────────

    #[test]
    fn logs_kept_per_source() {
        let hub = StatusHub::new();
        hub.log_info("front");
        hub.log(LogSource::Management, LogLevel::Warning, "mgmt");
        hub.log(LogSource::Console, LogLevel::Debug, "console");
        assert_eq!(hub.logs(LogSource::Front).len(), 1);
        assert_eq!(hub.logs(LogSource::Management)[0].message, "mgmt");
        assert_eq!(hub.all_logs().len(), 3);
        hub.clear_logs();
        assert!(hub.all_logs().is_empty());
    }

    // ── Traffic ──────────────────────────────────────────────────

    #[test]
    fn byte_count_reaches_live_listeners() {
        let hub = StatusHub::new();
        let counter = Arc::new(Counter(AtomicU64::new(0)));
        hub.add_byte_count_listener(Arc::<Counter>::downgrade(&counter));

        hub.update_byte_count(100, 10);
        let e = hub.update_byte_count(250, 20);
        assert_eq!(e.diff_in, 150);
        assert_eq!(counter.0.load(Ordering::SeqCst), 250);

        drop(counter);
        hub.update_byte_count(300, 30);
        assert_eq!(hub.last_byte_count().bytes_in, 300);
    }
}
