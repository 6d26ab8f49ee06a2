use std::sync::Arc;

#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::PrometheusHandle;

use chatgate_whatsapp::{ConnectionManager, MessageGateway};

use crate::auth::ResolvedAuth;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: ConnectionManager,
    pub messages: MessageGateway,
    pub auth: Arc<ResolvedAuth>,
    pub version: &'static str,
    #[cfg(feature = "prometheus")]
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(messages: MessageGateway, auth: ResolvedAuth) -> Self {
        Self {
            manager: messages.manager().clone(),
            messages,
            auth: Arc::new(auth),
            version: env!("CARGO_PKG_VERSION"),
            #[cfg(feature = "prometheus")]
            prometheus: None,
        }
    }

    #[cfg(feature = "prometheus")]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}
