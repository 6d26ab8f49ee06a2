//! WhatsApp connectivity: the connection manager that owns the session
//! lifecycle, credential persistence, enrollment QR rendering and the
//! outbound message gateway.
//!
//! The wire protocol itself lives behind [`chatgate_channels::SessionProvider`];
//! [`BridgeProvider`] runs it in a sidecar process.

pub mod bridge;
pub mod error;
pub mod manager;
pub mod outbound;
pub mod qr;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use {
    bridge::BridgeProvider,
    error::{Error, Result},
    manager::{
        ConnectionManager, ConnectionState, ConnectionStatus, EnrollmentRenderer, ManagerOptions,
    },
    outbound::{DEFAULT_DOMAIN, DispatchReceipt, MessageGateway, OutboundMessage},
    store::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoreError},
};
