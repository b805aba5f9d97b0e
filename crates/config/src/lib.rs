//! Configuration loading and validation.
//!
//! Config files: `flowline.toml`, `flowline.yaml`, `flowline.yml` or
//! `flowline.json`, searched in `./` then the user config directory
//! (`~/.config/flowline/` on Linux). `${ENV_VAR}` and `${ENV_VAR:-default}`
//! placeholders are substituted before parsing.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        Format, LoadedConfig, config_dir, find_config_file, load_config, load_config_value,
        load_or_default, to_toml_string,
    },
    schema::{
        FileSystemTransportConfig, FlowlineConfig, MessageStoreConfig, RateLimitConfig,
        RunnerConfig, ServiceConfig, ShortCircuitConfig, TransportConfig, WrappersConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, check_config, validate, validate_str},
};
