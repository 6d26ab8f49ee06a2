use serde::{Deserialize, Serialize};

/// Opaque identity material handed to a provider on connect.
///
/// The core never interprets `data`. `revision` advances by one on every
/// persisted update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub revision: u64,
    pub data: serde_json::Value,
}

impl Credentials {
    pub fn new(revision: u64, data: serde_json::Value) -> Self {
        Self { revision, data }
    }

    /// Initial state: nothing persisted yet, enrollment will be required.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        match &self.data {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}
