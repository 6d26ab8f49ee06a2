//! Gateway: the HTTP surface in front of the connection manager.
//!
//! Lifecycle:
//! 1. Load config (file + env overrides)
//! 2. Resolve the shared secret and build the credential store, provider and manager
//! 3. Start the HTTP server, then kick off the first connect in the background
//! 4. On Ctrl-C stop accepting requests and disconnect the session

pub mod auth;
pub mod error;
pub mod server;
pub mod state;

pub use {
    error::ApiError,
    server::{build_gateway_app, start_gateway},
    state::AppState,
};
