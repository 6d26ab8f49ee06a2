//! Config schema types (server, auth, whatsapp session).

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatgateConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub whatsapp: WhatsAppConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Origins allowed by CORS. Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 3000,
            allowed_origins: Vec::new(),
        }
    }
}

/// Shared-secret configuration for the protected endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// API password. `API_PASSWORD` in the environment takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Messaging session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Directory holding the persisted session credentials.
    pub auth_dir: PathBuf,
    /// Fixed delay before reconnecting after a non-terminal closure.
    pub retry_delay_secs: u64,
    /// Suffix appended to destinations that carry no `@domain`.
    pub default_domain: String,
    /// Render enrollment codes as a QR code on stderr.
    pub print_qr: bool,
    pub bridge: BridgeConfig,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            auth_dir: PathBuf::from("auth_info"),
            retry_delay_secs: 3,
            default_domain: "s.whatsapp.net".into(),
            print_qr: true,
            bridge: BridgeConfig::default(),
        }
    }
}

/// The sidecar process that speaks the messaging protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub send_timeout_secs: u64,
    pub env: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: "chatgate-bridge".into(),
            args: Vec::new(),
            send_timeout_secs: 30,
            env: HashMap::new(),
        }
    }
}

impl ChatgateConfig {
    /// The listen address as `bind:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ChatgateConfig::default();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:3000");
        assert!(cfg.auth.password.is_none());
        assert_eq!(cfg.whatsapp.retry_delay_secs, 3);
        assert_eq!(cfg.whatsapp.default_domain, "s.whatsapp.net");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: ChatgateConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [whatsapp.bridge]
            command = "node"
            args = ["bridge.mjs"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "0.0.0.0");
        assert_eq!(cfg.whatsapp.bridge.command, "node");
        assert_eq!(cfg.whatsapp.bridge.args, vec!["bridge.mjs".to_string()]);
        assert_eq!(cfg.whatsapp.bridge.send_timeout_secs, 30);
    }
}
