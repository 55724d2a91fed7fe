//! Generation run configuration loading and validation (.fable/config.toml).

pub mod config;
pub mod validate;

pub use config::{BackendConfig, ForgeConfig, ModelEntry, RunConfig, parse_max_concurrent};
pub use validate::validate_config;
