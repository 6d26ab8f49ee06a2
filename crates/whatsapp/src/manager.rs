//! Connection lifecycle: one session at a time, automatic retry after
//! non-terminal closures, and the readiness gate consulted before sends.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> (AwaitingEnrollment)? -> Connected
//! Connected | Connecting | AwaitingEnrollment -> Closing -> Disconnected   (explicit)
//! Connected | Connecting | AwaitingEnrollment -> Disconnected             (provider close)
//! ```
//!
//! Every connect attempt gets a new generation number. Events are tagged
//! with the generation of the session that emitted them and dropped once a
//! newer attempt (or an explicit disconnect) has superseded it.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use {
    serde::Serialize,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    chatgate_channels::{CloseReason, SessionEvent, SessionHandle, SessionProvider},
    chatgate_config::WhatsAppConfig,
};

use crate::{qr, store::CredentialStore};

/// Called with each enrollment code the provider asks the user to approve.
pub type EnrollmentRenderer = Arc<dyn Fn(&str) + Send + Sync>;

/// Observable state of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingEnrollment,
    Connected,
    Closing,
}

/// Point-in-time view of the manager, for logs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub generation: u64,
    pub enrollment_code: Option<String>,
    pub last_disconnect: Option<String>,
    pub logged_out: bool,
    pub retry_pending: bool,
}

/// Tunables for [`ConnectionManager`].
#[derive(Clone)]
pub struct ManagerOptions {
    pub retry_delay: Duration,
    pub on_enrollment: EnrollmentRenderer,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(3),
            on_enrollment: Arc::new(qr::print_enrollment),
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &WhatsAppConfig) -> Self {
        let on_enrollment: EnrollmentRenderer = if config.print_qr {
            Arc::new(qr::print_enrollment)
        } else {
            Arc::new(|_: &str| {})
        };
        Self {
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            on_enrollment,
        }
    }
}

struct Session {
    generation: u64,
    state: ConnectionState,
    handle: Option<Arc<dyn SessionHandle>>,
    enrollment_code: Option<String>,
    last_disconnect: Option<CloseReason>,
}

struct Inner {
    provider: Arc<dyn SessionProvider>,
    store: Arc<dyn CredentialStore>,
    options: ManagerOptions,
    session: Mutex<Session>,
    /// Serializes connect / disconnect / reconnect: no concurrent handshakes.
    lifecycle: tokio::sync::Mutex<()>,
    retry: Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retry_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of the single messaging session.
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("provider", &self.inner.provider.id())
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionManager {
    /// Construct the manager. Nothing connects until [`connect`](Self::connect).
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn CredentialStore>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                options,
                session: Mutex::new(Session {
                    generation: 0,
                    state: ConnectionState::Disconnected,
                    handle: None,
                    enrollment_code: None,
                    last_disconnect: None,
                }),
                lifecycle: tokio::sync::Mutex::new(()),
                retry: Mutex::new(None),
            }),
        }
    }

    /// True iff the session is open and a live handle exists.
    pub fn is_ready(&self) -> bool {
        let s = self.inner.session();
        s.state == ConnectionState::Connected && s.handle.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session().state
    }

    pub fn status(&self) -> ConnectionStatus {
        let retry_pending = self.has_pending_retry();
        let s = self.inner.session();
        ConnectionStatus {
            state: s.state,
            generation: s.generation,
            enrollment_code: s.enrollment_code.clone(),
            last_disconnect: s.last_disconnect.as_ref().map(ToString::to_string),
            logged_out: s
                .last_disconnect
                .as_ref()
                .is_some_and(CloseReason::is_logged_out),
            retry_pending,
        }
    }

    /// Whether an automatic reconnect is scheduled and not yet cancelled.
    pub fn has_pending_retry(&self) -> bool {
        self.inner
            .retry_slot()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// The live handle, only while the readiness gate is open.
    pub(crate) fn ready_handle(&self) -> Option<Arc<dyn SessionHandle>> {
        let s = self.inner.session();
        if s.state == ConnectionState::Connected {
            s.handle.clone()
        } else {
            None
        }
    }

    /// Start a new session from the stored credentials.
    ///
    /// Returns `false` if the credentials could not be loaded or the provider
    /// could not construct a session; the manager is then `Disconnected`.
    /// `true` does not mean ready: the open event arrives asynchronously.
    pub async fn connect(&self) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.connect_locked().await
    }

    /// Tear down the current session. Credentials are kept. No-op when
    /// already disconnected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.disconnect_locked().await;
    }

    /// `disconnect()` followed by `connect()`, atomically with respect to
    /// other lifecycle calls.
    pub async fn reconnect(&self) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        info!("reconnect requested");
        self.disconnect_locked().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> bool {
        self.cancel_retry();

        let (generation, previous) = {
            let mut s = self.inner.session();
            s.generation += 1;
            s.state = ConnectionState::Connecting;
            s.enrollment_code = None;
            (s.generation, s.handle.take())
        };
        if let Some(previous) = previous {
            debug!(generation, "replacing existing session");
            previous.close().await;
        }

        #[cfg(feature = "metrics")]
        metrics::counter!("chatgate_connect_attempts_total").increment(1);

        info!(generation, provider = self.inner.provider.id(), "connecting");

        let credentials = match self.inner.store.load().await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(generation, error = %e, "failed to load credentials");
                self.abandon_attempt(generation);
                return false;
            },
        };
        if credentials.is_empty() {
            info!(generation, "no stored credentials, enrollment will be required");
        } else {
            debug!(generation, revision = credentials.revision, "resuming stored identity");
        }

        let opened = match self.inner.provider.open(&credentials).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(generation, error = %e, "failed to start session");
                self.abandon_attempt(generation);
                return false;
            },
        };

        self.inner.session().handle = Some(Arc::clone(&opened.handle));
        tokio::spawn(run_session_events(
            Arc::downgrade(&self.inner),
            generation,
            opened.events,
        ));
        true
    }

    async fn disconnect_locked(&self) {
        self.cancel_retry();

        let handle = {
            let mut s = self.inner.session();
            if s.state == ConnectionState::Disconnected && s.handle.is_none() {
                debug!("disconnect requested while already disconnected");
                return;
            }
            s.generation += 1;
            s.state = ConnectionState::Closing;
            s.enrollment_code = None;
            s.handle.take()
        };

        info!("disconnecting");
        if let Some(handle) = handle {
            handle.close().await;
        }
        self.inner.session().state = ConnectionState::Disconnected;
    }

    fn abandon_attempt(&self, generation: u64) {
        let mut s = self.inner.session();
        if s.generation == generation {
            s.state = ConnectionState::Disconnected;
            s.handle = None;
        }
    }

    fn cancel_retry(&self) {
        if let Some(token) = self.inner.retry_slot().take() {
            token.cancel();
        }
    }

    fn schedule_retry(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.retry_slot().replace(token.clone()) {
            previous.cancel();
        }

        let delay = self.inner.options.retry_delay;
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => debug!("scheduled reconnect cancelled"),
                () = tokio::time::sleep(delay) => {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    let manager = ConnectionManager { inner };
                    if !manager.connect().await {
                        warn!("automatic reconnect failed");
                    }
                },
            }
        });
    }

    /// Apply one lifecycle event. Returns `false` once the emitting session
    /// is finished (closed or superseded).
    async fn handle_event(&self, generation: u64, event: SessionEvent) -> bool {
        match event {
            SessionEvent::EnrollmentCode(code) => {
                {
                    let mut s = self.inner.session();
                    if s.generation != generation {
                        return stale(generation, s.generation);
                    }
                    if !matches!(
                        s.state,
                        ConnectionState::Connecting | ConnectionState::AwaitingEnrollment
                    ) {
                        debug!(state = ?s.state, "ignoring enrollment code outside handshake");
                        return true;
                    }
                    s.state = ConnectionState::AwaitingEnrollment;
                    s.enrollment_code = Some(code.clone());
                }
                info!(generation, "enrollment required, waiting for the code to be scanned");
                (self.inner.options.on_enrollment)(&code);
                true
            },
            SessionEvent::Open => {
                let mut s = self.inner.session();
                if s.generation != generation {
                    return stale(generation, s.generation);
                }
                let state = s.state;
                match state {
                    ConnectionState::Connecting | ConnectionState::AwaitingEnrollment
                        if s.handle.is_some() =>
                    {
                        s.state = ConnectionState::Connected;
                        s.enrollment_code = None;
                        s.last_disconnect = None;
                        info!(generation, "connection established");
                    },
                    state => debug!(?state, "ignoring open event"),
                }
                true
            },
            SessionEvent::CredentialsUpdated(data) => {
                {
                    let s = self.inner.session();
                    if s.generation != generation {
                        return stale(generation, s.generation);
                    }
                }
                match self.inner.store.save(data).await {
                    Ok(saved) => debug!(generation, revision = saved.revision, "credentials updated"),
                    Err(e) => warn!(generation, error = %e, "failed to persist credentials"),
                }
                true
            },
            SessionEvent::Closed(reason) => {
                let logged_out = reason.is_logged_out();
                {
                    let mut s = self.inner.session();
                    if s.generation != generation {
                        return stale(generation, s.generation);
                    }
                    s.state = ConnectionState::Disconnected;
                    s.handle = None;
                    s.enrollment_code = None;
                    s.last_disconnect = Some(reason.clone());
                }

                #[cfg(feature = "metrics")]
                metrics::counter!(
                    "chatgate_disconnects_total",
                    "logged_out" => if logged_out { "true" } else { "false" }
                )
                .increment(1);

                if logged_out {
                    warn!(
                        generation,
                        %reason,
                        "session logged out, automatic reconnect disabled until an explicit reconnect"
                    );
                } else {
                    info!(
                        generation,
                        %reason,
                        delay = ?self.inner.options.retry_delay,
                        "connection closed, scheduling reconnect"
                    );
                    self.schedule_retry();
                }
                false
            },
        }
    }
}

fn stale(generation: u64, current: u64) -> bool {
    debug!(generation, current, "ignoring event from superseded session");
    false
}

async fn run_session_events(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = ConnectionManager { inner };
        if !manager.handle_event(generation, event).await {
            break;
        }
    }
    debug!(generation, "session event stream finished");
}
