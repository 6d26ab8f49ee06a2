use std::sync::Arc;

use {async_trait::async_trait, tokio::sync::mpsc};

use crate::{
    credentials::Credentials,
    envelope::{Envelope, SendReceipt},
    error::Result,
    event::SessionEvent,
};

/// Builds sessions against a messaging network.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Provider identifier (e.g. "bridge").
    fn id(&self) -> &str;

    /// Start a new session from the given credentials.
    ///
    /// Returning `Ok` only means the session was constructed; it becomes
    /// usable once it emits [`SessionEvent::Open`].
    async fn open(&self, credentials: &Credentials) -> Result<OpenedSession>;
}

/// A live session plus the stream of lifecycle events it emits.
pub struct OpenedSession {
    pub handle: Arc<dyn SessionHandle>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl std::fmt::Debug for OpenedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSession").finish_non_exhaustive()
    }
}

/// Operations on one live session.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Submit an envelope to `to` (already in network address form).
    async fn send(&self, to: &str, envelope: &Envelope) -> Result<SendReceipt>;

    /// Tear the session down. Must be safe to call more than once.
    async fn close(&self);
}
