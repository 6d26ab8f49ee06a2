use chatgate_channels::ChannelError;

use crate::store::StoreError;

/// Failures surfaced by the connection core to its callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The readiness gate was closed when the send was attempted.
    #[error("whatsapp is not connected")]
    NotConnected,

    /// The provider rejected or failed to deliver the envelope.
    #[error("failed to send message: {0}")]
    DispatchFailed(String),

    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, Error>;
