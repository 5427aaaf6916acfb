//! Configuration loading, validation and env substitution for the router.
//!
//! Config files: `switchyard.toml`, `switchyard.yaml`, `switchyard.yml` or
//! `switchyard.json`, searched in `./` then `~/.config/switchyard/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in the raw
//! file text before parsing.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        apply_env_overrides, config_dir, data_dir, discover_and_load, find_config_file,
        load_config, set_config_dir, set_data_dir,
    },
    schema::{AuthConfig, LimitsConfig, ServerConfig, StorageConfig, SwitchyardConfig},
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
