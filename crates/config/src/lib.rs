//! Configuration loading and validation.
//!
//! Config files: `crier.toml`, `crier.yaml`, or `crier.json`,
//! searched in `./` then `~/.config/crier/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_or_default_config_path, load_config, save_config},
    schema::{
        CrierConfig, HealthConfig, NotifierConfig, PersistenceConfig, PoolConfig, PromoterConfig,
        RotationConfig,
    },
    validate::{validate_config, Diagnostic, Severity, ValidationResult},
};
