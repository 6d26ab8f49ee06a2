//! In-process session provider for tests.
//!
//! Every `open()` creates a [`FakeHandle`] and keeps the sending half of its
//! event channel so tests can script lifecycle events.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use {async_trait::async_trait, tokio::sync::mpsc};

use chatgate_channels::{
    ChannelError, Credentials, Envelope, OpenedSession, Result, SendReceipt, SessionEvent,
    SessionHandle, SessionProvider,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FakeSession {
    events: mpsc::UnboundedSender<SessionEvent>,
    handle: Arc<FakeHandle>,
}

#[derive(Default)]
pub struct FakeProvider {
    sessions: Mutex<Vec<FakeSession>>,
    credentials: Mutex<Vec<Credentials>>,
    fail_next: Mutex<Option<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open()` fail with `reason`.
    pub fn fail_next_open(&self, reason: &str) {
        *lock(&self.fail_next) = Some(reason.into());
    }

    /// Number of sessions opened so far.
    pub fn open_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Credentials passed to the most recent `open()`.
    pub fn last_credentials(&self) -> Option<Credentials> {
        lock(&self.credentials).last().cloned()
    }

    pub fn handle(&self, index: usize) -> Option<Arc<FakeHandle>> {
        lock(&self.sessions)
            .get(index)
            .map(|s| Arc::clone(&s.handle))
    }

    pub fn latest_handle(&self) -> Option<Arc<FakeHandle>> {
        lock(&self.sessions)
            .last()
            .map(|s| Arc::clone(&s.handle))
    }

    /// Emit an event from the most recently opened session.
    pub fn emit(&self, event: SessionEvent) {
        if let Some(session) = lock(&self.sessions).last() {
            let _ = session.events.send(event);
        }
    }

    /// Emit an event from the `index`-th opened session.
    pub fn emit_to(&self, index: usize, event: SessionEvent) {
        if let Some(session) = lock(&self.sessions).get(index) {
            let _ = session.events.send(event);
        }
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    fn id(&self) -> &str {
        "fake"
    }

    async fn open(&self, credentials: &Credentials) -> Result<OpenedSession> {
        if let Some(reason) = lock(&self.fail_next).take() {
            return Err(ChannelError::Spawn(reason));
        }
        lock(&self.credentials).push(credentials.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(FakeHandle::default());
        lock(&self.sessions).push(FakeSession {
            events: tx,
            handle: Arc::clone(&handle),
        });
        Ok(OpenedSession {
            handle,
            events: rx,
        })
    }
}

/// Records submitted envelopes and answers with sequential message ids.
#[derive(Default)]
pub struct FakeHandle {
    closed: AtomicBool,
    next_id: AtomicU64,
    sent: Mutex<Vec<(String, Envelope)>>,
    reject_with: Mutex<Option<String>>,
}

impl FakeHandle {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, Envelope)> {
        lock(&self.sent).clone()
    }

    /// Reject every following send with `reason`.
    pub fn reject_sends(&self, reason: &str) {
        *lock(&self.reject_with) = Some(reason.into());
    }
}

#[async_trait]
impl SessionHandle for FakeHandle {
    async fn send(&self, to: &str, envelope: &Envelope) -> Result<SendReceipt> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if let Some(reason) = lock(&self.reject_with).clone() {
            return Err(ChannelError::Rejected(reason));
        }
        lock(&self.sent).push((to.to_string(), envelope.clone()));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendReceipt {
            message_id: format!("FAKE{n:04}"),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
