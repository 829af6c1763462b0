//! Configuration for the job manager
//!
//! Loaded once at startup from `config.toml`; every field has a default, so
//! the file is optional.

mod defaults;
mod loader;
mod schema;

pub use defaults::DEFAULT_CONFIG_TOML;
pub use loader::ConfigLoader;
pub use schema::*;
