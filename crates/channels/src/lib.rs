//! Session provider contract.
//!
//! A provider owns the wire protocol of a messaging network. The core only
//! sees the [`SessionProvider`] / [`SessionHandle`] traits, the lifecycle
//! [`SessionEvent`]s a handle emits, and the [`Envelope`] it submits.

pub mod credentials;
pub mod envelope;
pub mod error;
pub mod event;
pub mod plugin;

pub use {
    credentials::Credentials,
    envelope::{Envelope, MediaKind, SendReceipt},
    error::{ChannelError, Result},
    event::{CloseReason, SessionEvent},
    plugin::{OpenedSession, SessionHandle, SessionProvider},
};
