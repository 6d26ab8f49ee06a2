//! Configuration loading for the chatgate gateway.
//!
//! Config files are discovered in the working directory and then in
//! `~/.config/chatgate/`, with `${ENV_VAR}` placeholders substituted before
//! parsing and a handful of environment variables applied on top.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        apply_env_overrides, clear_config_dir, config_dir, discover_and_load, load_config,
        set_config_dir,
    },
    schema::{AuthConfig, BridgeConfig, ChatgateConfig, ServerConfig, WhatsAppConfig},
};
