//! Engine management channel client.
//!
//! The engine connects to a local socket we listen on and speaks a line
//! protocol: `>CMD:argument` notifications from the engine, plain
//! commands from us. One [`ManagementSession`] drives one connection; its
//! [`SessionHandle`] is the shareable control surface (pause, resume,
//! hold release, shutdown).

use crate::vpn::auth::{parse_password_notice, resolve_credentials, CredentialKind, PasswordNotice};
use crate::vpn::logging::{parse_mgmt_log, redact_command, LogLevel, LogSource};
use crate::vpn::platform::{Platform, SignPadding};
use crate::vpn::profile::{escape, Connection, Profile};
use crate::vpn::routing::{apply_route, RouteSink};
use crate::vpn::service::SessionRegistry;
use crate::vpn::settings::CoreSettings;
use crate::vpn::status::StatusHub;
use crate::vpn::types::*;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const READ_CHUNK: usize = 2048;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control seams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Answers whether the tunnel should currently run.
pub trait PausedStateCallback: Send + Sync {
    fn should_be_running(&self) -> bool;
}

/// Control surface of a running engine session.
pub trait VpnControl: Send + Sync {
    fn pause_vpn(&self, reason: PauseReason);
    fn resume_vpn(&self);
    fn network_change(&self, same_network: bool);
    fn send_cr_response(&self, response: &str);
    /// Interrupt every tracked session. `false` if nothing could be sent.
    fn stop_vpn(&self) -> bool;
    fn set_pause_callback(&self, callback: Weak<dyn PausedStateCallback>);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Line grammar
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One line received from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtLine<'a> {
    /// `>CMD:argument`
    Notification { command: &'a str, argument: &'a str },
    /// Bare `PROTECTFD:` carrying a socket to exempt from the tunnel.
    ProtectFd,
    /// `SUCCESS:...`, version banners, `END`.
    Ack(&'a str),
    Unknown(&'a str),
}

pub fn parse_mgmt_line(line: &str) -> MgmtLine<'_> {
    if let Some(rest) = line.strip_prefix('>') {
        if let Some((command, argument)) = rest.split_once(':') {
            return MgmtLine::Notification { command, argument };
        }
        return MgmtLine::Unknown(line);
    }
    if line.starts_with("PROTECTFD:") {
        return MgmtLine::ProtectFd;
    }
    if line.starts_with("SUCCESS:")
        || line.starts_with("OpenVPN Version:")
        || line.starts_with("Management Version:")
        || line == "END"
    {
        return MgmtLine::Ack(line);
    }
    MgmtLine::Unknown(line)
}

/// Seconds to wait before releasing a hold, from `release:<secs>` or a
/// bare number. Never below one.
pub fn hold_wait_secs(arg: &str) -> u64 {
    let raw = match arg.rsplit_once(':') {
        Some((_, secs)) => secs,
        None => arg,
    };
    raw.trim().parse::<u64>().unwrap_or(1).max(1)
}

/// Text between the first pair of single quotes.
fn quoted_name(arg: &str) -> Option<&str> {
    let start = arg.find('\'')? + 1;
    let len = arg[start..].find('\'')?;
    Some(&arg[start..start + len])
}

/// Outbound command builders.
pub struct MgmtCommands;

impl MgmtCommands {
    pub const VERSION: &'static str = "version 3";
    pub const HOLD_RELEASE: &'static str = "hold release";
    pub const STATE_ON: &'static str = "state on";
    pub const PK_SIG: &'static str = "pk-sig";
    pub const END: &'static str = "END";
    pub const PROXY_NONE: &'static str = "proxy NONE";

    pub fn bytecount(interval: u64) -> String {
        format!("bytecount {}", interval)
    }

    pub fn signal(name: &str) -> String {
        format!("signal {}", name)
    }

    pub fn needok(needed: &str, status: &str) -> String {
        format!("needok '{}' {}", needed, status)
    }

    pub fn username(needed: &str, user: &str) -> String {
        format!("username '{}' {}", needed, escape(user))
    }

    pub fn password(needed: &str, pass: &str) -> String {
        format!("password '{}' {}", needed, escape(pass))
    }

    pub fn proxy(kind: ProxyType, host: &str, port: &str, auto_auth: bool) -> String {
        let mut cmd = format!("proxy {} {} {}", kind.as_wire(), host, port);
        if auto_auth {
            cmd.push_str(" auto");
        }
        cmd
    }

    pub fn network_change(same_network: bool) -> String {
        if same_network {
            "network-change samenetwork".to_string()
        } else {
            "network-change".to_string()
        }
    }

    pub fn cr_response(response: &str) -> String {
        format!("cr-response {}", response)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Proxy selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Proxy chosen for one `>PROXY:` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyChoice {
    pub kind: ProxyType,
    pub host: Option<String>,
    pub port: String,
    pub use_auth: bool,
}

impl ProxyChoice {
    pub fn none() -> Self {
        Self {
            kind: ProxyType::None,
            host: None,
            port: String::new(),
            use_auth: false,
        }
    }

    pub fn from_connection(conn: &Connection) -> Self {
        Self {
            kind: conn.proxy_type,
            host: conn.proxy_name.clone(),
            port: conn.proxy_port.clone(),
            use_auth: conn.use_proxy_auth,
        }
    }

    /// HTTP proxies cannot carry UDP.
    pub fn for_transport(mut self, proto: Option<&str>) -> Self {
        if self.kind == ProxyType::Http && proto == Some("UDP") {
            log::info!("Not using an HTTP proxy since the connection uses UDP");
            self.host = None;
        }
        self
    }

    pub fn command(&self) -> String {
        match (&self.kind, &self.host) {
            (ProxyType::None, _) | (_, None) => MgmtCommands::PROXY_NONE.to_string(),
            (kind, Some(host)) => MgmtCommands::proxy(*kind, host, &self.port, self.use_auth),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
enum Outbound {
    Line(String),
    Close,
}

#[derive(Debug, Default)]
struct HoldState {
    waiting: bool,
    release_timer: Option<JoinHandle<()>>,
    last_release: Option<Instant>,
    last_pause_reason: PauseReason,
    shutting_down: bool,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shareable control surface of one engine session.
pub struct SessionHandle {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Outbound>,
    hold: StdMutex<HoldState>,
    pause_callback: StdMutex<Option<Weak<dyn PausedStateCallback>>>,
    hub: Arc<StatusHub>,
    settings: CoreSettings,
    registry: Weak<SessionRegistry>,
    shutdown: Notify,
    me: Weak<SessionHandle>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a command. `false` once the channel is gone.
    pub fn send_command(&self, cmd: &str) -> bool {
        let reveal = cfg!(debug_assertions) || self.settings.debug_commands;
        self.hub.log(
            LogSource::Management,
            LogLevel::Debug,
            format!("> {}", redact_command(cmd, reveal)),
        );
        self.outbound.send(Outbound::Line(cmd.to_string())).is_ok()
    }

    pub fn is_waiting_for_release(&self) -> bool {
        lock(&self.hold).waiting
    }

    pub fn has_pending_release(&self) -> bool {
        lock(&self.hold).release_timer.is_some()
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.hold).shutting_down
    }

    pub fn last_pause_reason(&self) -> PauseReason {
        lock(&self.hold).last_pause_reason
    }

    fn should_be_running(&self) -> bool {
        let cb = lock(&self.pause_callback).as_ref().and_then(Weak::upgrade);
        cb.is_some_and(|cb| cb.should_be_running())
    }

    // ── Hold / release ───────────────────────────────────────────

    /// `>HOLD:` the engine waits for `hold release`.
    pub fn handle_hold(&self, arg: &str) {
        self.hub.log(LogSource::Management, LogLevel::Info, arg);
        let running = self.should_be_running();

        if !running {
            let reason = {
                let mut hold = lock(&self.hold);
                hold.waiting = true;
                hold.last_pause_reason
            };
            self.hub.update_status_pause(reason);
            return;
        }

        let wait = hold_wait_secs(arg);
        {
            let mut hold = lock(&self.hold);
            hold.waiting = true;
            self.schedule_release(&mut hold, Duration::from_secs(wait));
        }
        if wait > 1 {
            self.hub.update_status("CONNECTRETRY", &wait.to_string());
        }
        self.hub
            .log_info(format!("Waiting {} seconds before releasing hold", wait));
    }

    fn schedule_release(&self, hold: &mut HoldState, wait: Duration) {
        if let Some(timer) = hold.release_timer.take() {
            timer.abort();
        }
        let me = self.me.clone();
        hold.release_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(handle) = me.upgrade() {
                handle.release_timer_fired();
            }
        }));
    }

    fn release_timer_fired(&self) {
        // Detach rather than abort: this runs on the timer task itself.
        lock(&self.hold).release_timer = None;
        if self.should_be_running() {
            self.release_hold();
        }
    }

    /// Release a pending hold now. Releases closer together than the
    /// throttle window are delayed; the delayed release is cancelled like
    /// any other pending release.
    pub fn release_hold(&self) {
        let send_now = {
            let mut hold = lock(&self.hold);
            if !hold.waiting {
                return;
            }
            hold.waiting = false;
            if let Some(timer) = hold.release_timer.take() {
                timer.abort();
            }
            let now = Instant::now();
            let window = self.settings.release_throttle_window();
            let throttled = hold
                .last_release
                .is_some_and(|last| now.saturating_duration_since(last) < window);
            let delay = throttled.then(|| self.settings.release_throttle_delay());
            hold.last_release = Some(now + delay.unwrap_or_default());

            if let Some(delay) = delay {
                log::debug!("hold released again within the throttle window, delaying {:?}", delay);
                let me = self.me.clone();
                hold.release_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(handle) = me.upgrade() {
                        handle.delayed_release_fired();
                    }
                }));
            }
            delay.is_none()
        };

        if send_now {
            self.send_release_commands();
        }
    }

    fn delayed_release_fired(&self) {
        let released = {
            let mut hold = lock(&self.hold);
            hold.release_timer = None;
            !hold.waiting && !hold.shutting_down
        };
        // A new hold or a pause since the release was queued wins.
        if released && self.should_be_running() {
            self.send_release_commands();
        }
    }

    fn send_release_commands(&self) {
        self.send_command(MgmtCommands::HOLD_RELEASE);
        self.send_command(&MgmtCommands::bytecount(self.settings.bytecount_interval_secs));
        self.send_command(MgmtCommands::STATE_ON);
    }

    fn signal_usr1(&self) {
        let (waiting, reason) = {
            let mut hold = lock(&self.hold);
            if let Some(timer) = hold.release_timer.take() {
                timer.abort();
            }
            (hold.waiting, hold.last_pause_reason)
        };
        if waiting {
            self.hub.update_status_pause(reason);
        } else {
            self.send_command(&MgmtCommands::signal("SIGUSR1"));
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Interrupt this session's engine and close the channel.
    pub fn stop_session(&self) -> bool {
        let sent = self.send_command(&MgmtCommands::signal("SIGINT"));
        if sent {
            lock(&self.hold).shutting_down = true;
        }
        self.close();
        sent
    }

    /// Cancel timers and end the read loop.
    pub fn close(&self) {
        if let Some(timer) = lock(&self.hold).release_timer.take() {
            timer.abort();
        }
        let _ = self.outbound.send(Outbound::Close);
        self.shutdown.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.shutdown.notified().await
    }
}

impl VpnControl for SessionHandle {
    fn pause_vpn(&self, reason: PauseReason) {
        lock(&self.hold).last_pause_reason = reason;
        self.signal_usr1();
    }

    fn resume_vpn(&self) {
        self.release_hold();
        lock(&self.hold).last_pause_reason = PauseReason::NoNetwork;
    }

    fn network_change(&self, same_network: bool) {
        if self.is_waiting_for_release() {
            self.release_hold();
        } else {
            self.send_command(&MgmtCommands::network_change(same_network));
        }
    }

    fn send_cr_response(&self, response: &str) {
        self.send_command(&MgmtCommands::cr_response(response));
    }

    fn stop_vpn(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.stop_all(),
            None => self.stop_session(),
        }
    }

    fn set_pause_callback(&self, callback: Weak<dyn PausedStateCallback>) {
        *lock(&self.pause_callback) = Some(callback);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.hold).release_timer.take() {
            timer.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reads engine lines and answers them. Runs on a single task, so its
/// own fields need no locking.
pub struct ManagementSession {
    handle: Arc<SessionHandle>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
    profile: Arc<Profile>,
    platform: Platform,
    routes: Box<dyn RouteSink>,
    hub: Arc<StatusHub>,
    use_system_proxy: bool,
    /// Connection named by the last `>PROXY:`; answers `HTTP Proxy`
    /// credential prompts.
    proxy_connection: Option<Connection>,
}

impl ManagementSession {
    pub fn new(
        profile: Arc<Profile>,
        platform: Platform,
        routes: Box<dyn RouteSink>,
        hub: Arc<StatusHub>,
        settings: &CoreSettings,
        registry: Weak<SessionRegistry>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new_cyclic(|me| SessionHandle {
            id: Uuid::new_v4(),
            outbound: tx,
            hold: StdMutex::new(HoldState::default()),
            pause_callback: StdMutex::new(None),
            hub: hub.clone(),
            settings: settings.clone(),
            registry,
            shutdown: Notify::new(),
            me: me.clone(),
        });
        Self {
            handle,
            outbound_rx: Some(rx),
            profile,
            platform,
            routes,
            hub,
            use_system_proxy: settings.use_system_proxy,
            proxy_connection: None,
        }
    }

    pub fn handle(&self) -> Arc<SessionHandle> {
        self.handle.clone()
    }

    /// Drive the channel until the engine disconnects or the session is
    /// stopped, then publish `NOPROCESS`.
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let writer_task = self.outbound_rx.take().map(|mut rx| {
            tokio::spawn(async move {
                while let Some(out) = rx.recv().await {
                    match out {
                        Outbound::Line(line) => {
                            let data = format!("{}\n", line);
                            if writer.write_all(data.as_bytes()).await.is_err()
                                || writer.flush().await.is_err()
                            {
                                break;
                            }
                        }
                        Outbound::Close => {
                            let _ = writer.shutdown().await;
                            break;
                        }
                    }
                }
            })
        });

        self.handle.send_command(MgmtCommands::VERSION);

        let handle = self.handle.clone();
        let mut buf = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            tokio::select! {
                _ = handle.shutdown.notified() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                            let raw: Vec<u8> = pending.drain(..=pos).collect();
                            let text = String::from_utf8_lossy(&raw);
                            let line = text.trim_end_matches(['\r', '\n']);
                            if !line.is_empty() {
                                self.process_line(line).await;
                            }
                        }
                    }
                    Err(e) => {
                        log::debug!("management channel read failed: {}", e);
                        break;
                    }
                },
            }
        }

        handle.close();
        if let Some(task) = writer_task {
            let _ = task.await;
        }
        if let Some(registry) = handle.registry.upgrade() {
            registry.remove(handle.id());
        }
        self.hub.update_status("NOPROCESS", "No process running");
    }

    fn mgmt_log(&self, level: LogLevel, message: impl Into<String>) {
        self.hub.log(LogSource::Management, level, message);
    }

    /// Handle one complete line.
    pub async fn process_line(&mut self, line: &str) {
        match parse_mgmt_line(line) {
            MgmtLine::Notification { command, argument } => self.dispatch(command, argument).await,
            MgmtLine::ProtectFd => {
                self.platform.tunnels.protect_pending_socket();
            }
            MgmtLine::Ack(text) => self.mgmt_log(LogLevel::Info, text),
            MgmtLine::Unknown(text) => {
                self.mgmt_log(
                    LogLevel::Warning,
                    format!("MGMT: Got unrecognized line from management: {}", text),
                );
            }
        }
    }

    async fn dispatch(&mut self, command: &str, argument: &str) {
        match command {
            "INFO" => self.mgmt_log(LogLevel::Info, argument),
            "PASSWORD" => self.handle_password(argument),
            "HOLD" => self.handle.handle_hold(argument),
            "NEED-OK" => self.handle_need_ok(argument).await,
            "BYTECOUNT" => self.handle_byte_count(argument),
            "STATE" => self.handle_state(argument),
            "PROXY" => self.handle_proxy(argument).await,
            "LOG" => self.handle_log(argument),
            "PK_SIGN" => self.handle_pk_sign(argument).await,
            "INFOMSG" => self.handle_info_msg(argument),
            _ => self.mgmt_log(
                LogLevel::Warning,
                format!("MGMT: Got unrecognized command {}:{}", command, argument),
            ),
        }
    }

    // ── Status and traffic ───────────────────────────────────────

    fn handle_state(&self, arg: &str) {
        self.mgmt_log(LogLevel::Info, arg);
        if self.handle.is_shutting_down() {
            return;
        }
        let parts: Vec<&str> = arg.splitn(3, ',').collect();
        let Some(state) = parts.get(1) else {
            self.mgmt_log(LogLevel::Warning, format!("Malformed STATE line: {}", arg));
            return;
        };
        let message = parts
            .get(2)
            .map(|m| m.trim_matches([',', ' ', '\t', '|']))
            .unwrap_or("");
        self.hub.update_status(state, message);
    }

    fn handle_byte_count(&self, arg: &str) {
        let parsed = arg
            .split_once(',')
            .and_then(|(i, o)| Some((i.trim().parse::<u64>().ok()?, o.trim().parse::<u64>().ok()?)));
        match parsed {
            Some((bytes_in, bytes_out)) => {
                self.hub.update_byte_count(bytes_in, bytes_out);
            }
            None => self.mgmt_log(LogLevel::Warning, format!("Malformed BYTECOUNT: {}", arg)),
        }
    }

    fn handle_log(&self, arg: &str) {
        match parse_mgmt_log(arg) {
            Some(entry) => {
                self.hub.observe_engine_log(&entry.message);
                self.hub.log_entry(entry);
            }
            None => self.mgmt_log(LogLevel::Warning, format!("Malformed LOG line: {}", arg)),
        }
    }

    fn handle_info_msg(&self, arg: &str) {
        if arg.starts_with("OPEN_URL:") || arg.starts_with("CR_TEXT:") {
            self.platform.notifier.sso_prompt(arg);
            self.hub.update_status("USER_INPUT", arg);
        } else {
            self.hub
                .log_debug(format!("Info message from server: {}", arg));
        }
    }

    // ── Proxy ────────────────────────────────────────────────────

    async fn handle_proxy(&mut self, arg: &str) {
        self.mgmt_log(LogLevel::Info, arg);
        let args: Vec<&str> = arg.splitn(3, ',').collect();

        let conn = args[0]
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| self.profile.connections.get(idx))
            .cloned();

        let mut choice = match &conn {
            Some(c) => ProxyChoice::from_connection(c),
            None => {
                self.hub.log_error(format!(
                    "Engine is asking for a proxy of an unknown connection entry ({})",
                    args[0]
                ));
                ProxyChoice::none()
            }
        };

        if choice.kind == ProxyType::None && self.use_system_proxy {
            if let Some(c) = &conn {
                if let Some((host, port)) = self.platform.proxies.detect(c).await {
                    choice = ProxyChoice {
                        kind: ProxyType::Http,
                        host: Some(host),
                        port,
                        use_auth: false,
                    };
                }
            }
        }

        let choice = choice.for_transport(args.get(1).map(|p| p.trim()));
        if let (Some(host), ProxyType::Http | ProxyType::Socks5) = (&choice.host, choice.kind) {
            self.hub
                .log_info(format!("Using {} proxy {} {}", choice.kind.as_wire(), host, choice.port));
        }
        self.proxy_connection = conn;
        self.handle.send_command(&choice.command());
    }

    // ── Credentials ──────────────────────────────────────────────

    fn handle_password(&mut self, arg: &str) {
        self.mgmt_log(LogLevel::Info, arg);
        let notice = match parse_password_notice(arg) {
            Ok(n) => n,
            Err(e) => {
                self.hub.log_error(e.message);
                return;
            }
        };

        match notice {
            PasswordNotice::AuthToken => {}
            PasswordNotice::VerificationFailed { needed, reason } => {
                self.hub.log_warning(format!("Verification of '{}' failed: {}", needed, reason));
                self.hub.update_status("AUTH_FAILED", &reason);
            }
            PasswordNotice::Need(needed) => {
                let kind = CredentialKind::from_wire(&needed);
                let answer = kind.and_then(|k| {
                    resolve_credentials(
                        &self.profile,
                        k,
                        self.platform.credentials.as_ref(),
                        self.proxy_connection.as_ref(),
                    )
                });
                match answer {
                    Some(answer) => {
                        if let Some(user) = &answer.username {
                            self.handle.send_command(&MgmtCommands::username(&needed, user));
                        }
                        self.handle
                            .send_command(&MgmtCommands::password(&needed, &answer.password));
                    }
                    None => {
                        if let Some(k) = kind {
                            self.platform.notifier.request_input(k);
                        }
                        self.hub.update_status("NEED", &format!("need {}", needed));
                        self.hub.log_error(format!(
                            "Engine requires Authentication type '{}' but no password/key information available",
                            needed
                        ));
                    }
                }
            }
        }
    }

    // ── NEED-OK ──────────────────────────────────────────────────

    async fn handle_need_ok(&mut self, arg: &str) {
        let Some(needed) = quoted_name(arg) else {
            self.hub
                .log_error(format!("Could not parse management NEED-OK command: {}", arg));
            return;
        };
        let needed = needed.to_string();
        let extra = arg.split_once(':').map(|(_, e)| e).unwrap_or("");
        let mut status = "ok";

        match needed.as_str() {
            "PROTECTFD" => {
                self.platform.tunnels.protect_pending_socket();
            }
            "DNSSERVER" | "DNS6SERVER" => self.routes.add_dns(extra),
            "DNSDOMAIN" => self.routes.set_domain(extra),
            "ROUTE" => {
                if let Err(e) = apply_route(self.routes.as_mut(), extra) {
                    self.hub.log_error(e.message);
                }
            }
            "ROUTE6" => match extra.split_once(' ') {
                Some((network, device)) => self.routes.add_route_v6(network, device),
                None => self.routes.add_route_v6(extra, ""),
            },
            "IFCONFIG" => {
                let parts: Vec<&str> = extra.split(' ').collect();
                match (parts.len(), parts.get(2).and_then(|m| m.parse::<u32>().ok())) {
                    (4, Some(mtu)) => self.routes.set_local_ip(parts[0], parts[1], mtu, parts[3]),
                    _ => self
                        .hub
                        .log_error(format!("Unrecognized IFCONFIG cmd: {}", extra)),
                }
            }
            "IFCONFIG6" => {
                let parts: Vec<&str> = extra.split(' ').collect();
                if let Some(mtu) = parts.get(1).and_then(|m| m.parse::<u32>().ok()) {
                    self.routes.set_mtu(mtu);
                }
                self.routes.set_local_ipv6(parts[0]);
            }
            "PERSIST_TUN_ACTION" => status = self.routes.tun_reopen_status(),
            "OPENTUN" => {
                if self.open_tun(extra).await {
                    self.handle.send_command(&MgmtCommands::needok(&needed, "ok"));
                    return;
                }
                status = "cancel";
            }
            other => {
                self.hub
                    .log_error(format!("Unknown needok command {}", other));
                return;
            }
        }

        self.handle.send_command(&MgmtCommands::needok(&needed, status));
    }

    async fn open_tun(&mut self, device_type: &str) -> bool {
        if device_type != "tun" {
            self.hub.log_error(format!(
                "Device type {} requested, but only tun is possible",
                device_type
            ));
            return false;
        }
        let config = self.routes.take_config();
        if !config.has_address() {
            self.hub
                .log_error("Refusing to open tun device without IP information");
            return false;
        }
        match self.platform.tunnels.open_tun(&config).await {
            Ok(tun) => {
                self.routes.mark_opened(&config);
                self.hub.log_debug(format!("Opened tun device (fd {})", tun.fd));
                true
            }
            Err(e) => {
                self.hub.log_error(format!("Could not open tun device: {}", e));
                false
            }
        }
    }

    // ── External key ─────────────────────────────────────────────

    async fn handle_pk_sign(&mut self, arg: &str) {
        let parts: Vec<&str> = arg.split(',').collect();
        let padding = SignPadding::from_wire(parts.get(1).map(|p| p.trim()));

        match self.sign(parts[0].trim(), padding).await {
            Ok(signature) if !signature.is_empty() => {
                self.handle.send_command(MgmtCommands::PK_SIG);
                self.handle.send_command(&signature);
                self.handle.send_command(MgmtCommands::END);
            }
            result => {
                if let Err(e) = result {
                    self.hub.log_error(format!("Error in RSA signing: {}", e));
                }
                self.handle.send_command(MgmtCommands::PK_SIG);
                self.handle.send_command("");
                self.handle.send_command(MgmtCommands::END);
                self.handle.stop_vpn();
            }
        }
    }

    async fn sign(&self, data_b64: &str, padding: SignPadding) -> Result<String, VpnError> {
        if !self.profile.authentication_type.uses_keystore() {
            return Err(VpnError::new(
                VpnErrorKind::Signing,
                "profile has no external key",
            ));
        }
        let alias = self.profile.alias.as_deref().ok_or_else(|| {
            VpnError::new(VpnErrorKind::Signing, "no keystore alias configured")
        })?;
        let data = STANDARD.decode(data_b64).map_err(|e| {
            VpnError::new(VpnErrorKind::Signing, "invalid base64 in PK_SIGN").with_detail(e.to_string())
        })?;
        let signature = self.platform.signer.sign(alias, &data, padding).await?;
        Ok(STANDARD.encode(signature))
    }
}
