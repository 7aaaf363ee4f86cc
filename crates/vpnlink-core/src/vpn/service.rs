//! Process-scoped session service: the registry of live sessions and the
//! control socket an engine connects back to.

use crate::vpn::management::{ManagementSession, SessionHandle, VpnControl};
use crate::vpn::pause::DeviceStateController;
use crate::vpn::platform::Platform;
use crate::vpn::profile::Profile;
use crate::vpn::routing::RouteSink;
use crate::vpn::settings::CoreSettings;
use crate::vpn::status::StatusHub;
use crate::vpn::types::*;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every session that has not yet finished.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: StdMutex<Vec<Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, handle: Arc<SessionHandle>) {
        let mut sessions = lock(&self.sessions);
        if !sessions.iter().any(|s| s.id() == handle.id()) {
            sessions.push(handle);
        }
    }

    pub fn remove(&self, id: Uuid) {
        lock(&self.sessions).retain(|s| s.id() != id);
    }

    /// Send SIGINT to every session. `true` if at least one was reached.
    pub fn stop_all(&self) -> bool {
        let sessions: Vec<Arc<SessionHandle>> = lock(&self.sessions).clone();
        let mut sent = false;
        for s in sessions {
            sent |= s.stop_session();
        }
        sent
    }

    /// Most recently started session.
    pub fn latest(&self) -> Option<Arc<SessionHandle>> {
        lock(&self.sessions).last().cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control socket
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bind the management socket, retrying while the path is unusable.
/// A leftover socket file from an earlier run is removed first.
pub async fn bind_control_socket(
    path: &Path,
    settings: &CoreSettings,
) -> Result<UnixListener, VpnError> {
    let mut last_err = None;
    for attempt in 1..=settings.bind_retries {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        match UnixListener::bind(path) {
            Ok(listener) => {
                log::debug!("management socket bound at {} (attempt {})", path.display(), attempt);
                return Ok(listener);
            }
            Err(e) => {
                log::debug!("bind {} failed (attempt {}): {}", path.display(), attempt, e);
                last_err = Some(e);
            }
        }
        if attempt < settings.bind_retries {
            tokio::time::sleep(settings.bind_retry_delay()).await;
        }
    }

    let mut err = VpnError::new(
        VpnErrorKind::Bind,
        format!("Could not bind management socket {}", path.display()),
    );
    if let Some(e) = last_err {
        err = err.with_detail(e.to_string());
    }
    Err(err)
}

/// Accept exactly one peer, then stop listening.
pub async fn accept_single(listener: UnixListener, path: &Path) -> Result<UnixStream, VpnError> {
    let accepted = listener.accept().await;
    drop(listener);
    let _ = std::fs::remove_file(path);
    let (stream, _) = accepted.map_err(|e| {
        VpnError::new(VpnErrorKind::Io, "Failed to accept management connection")
            .with_detail(e.to_string())
    })?;
    Ok(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A started session and its pause controller.
pub struct ActiveSession {
    pub handle: Arc<SessionHandle>,
    pub pause: Arc<DeviceStateController>,
    task: JoinHandle<()>,
}

impl ActiveSession {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the engine has disconnected or the session was stopped.
    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

/// Owns the status hub and the session registry for the whole process.
pub struct VpnService {
    hub: Arc<StatusHub>,
    registry: Arc<SessionRegistry>,
    platform: Platform,
    settings: CoreSettings,
}

impl VpnService {
    pub fn new(platform: Platform, settings: CoreSettings) -> Self {
        Self {
            hub: StatusHub::new(),
            registry: SessionRegistry::new(),
            platform,
            settings,
        }
    }

    pub fn hub(&self) -> Arc<StatusHub> {
        self.hub.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    /// Bind the control socket and serve the engine that connects to it
    /// in the background.
    pub async fn start_session(
        &self,
        profile: Arc<Profile>,
        routes: Box<dyn RouteSink>,
    ) -> Result<ActiveSession, VpnError> {
        let path = self.settings.management_socket.clone();
        let listener = bind_control_socket(&path, &self.settings).await?;

        let session = ManagementSession::new(
            profile.clone(),
            self.platform.clone(),
            routes,
            self.hub.clone(),
            &self.settings,
            Arc::downgrade(&self.registry),
        );
        let handle = session.handle();
        self.registry.register(handle.clone());
        let control: Arc<dyn VpnControl> = handle.clone();
        let pause = DeviceStateController::new(control, self.hub.clone(), &self.settings);

        self.hub.set_connected_profile(Some(profile.uuid.to_string()));
        self.hub.log_info(format!("Starting session for {}", profile.name));

        let hub = self.hub.clone();
        let registry = self.registry.clone();
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            let accepted = tokio::select! {
                accepted = accept_single(listener, &path) => accepted,
                _ = waiter.closed() => {
                    let _ = std::fs::remove_file(&path);
                    Err(VpnError::new(VpnErrorKind::Io, "Session stopped before the engine connected"))
                }
            };
            match accepted {
                Ok(stream) => session.run(stream).await,
                Err(e) => {
                    hub.log_error(e.to_string());
                    registry.remove(waiter.id());
                    hub.update_status("NOPROCESS", "No process running");
                }
            }
        });

        Ok(ActiveSession { handle, pause, task })
    }

    /// Interrupt every running session.
    pub fn stop_all(&self) -> bool {
        self.registry.stop_all()
    }
}
