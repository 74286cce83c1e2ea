//! Configuration loading, validation, and env substitution.
//!
//! Config files: `wxrelay.toml`, `wxrelay.yaml`, or `wxrelay.json`
//! Searched in `./` then `~/.config/wxrelay/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        config_dir, data_dir, discover_and_load, find_config_file, load_config, save_config,
        set_data_dir,
    },
    schema::{
        DatabaseConfig, DeliveryConfig, FixedListenerSeed, InstanceEntry, ListenerConfig,
        PlatformEntry, PlatformKind, RuleSeed, SendMode, SenderConfig, WxRelayConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
