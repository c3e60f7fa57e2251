//! Configuration Module
//!
//! Environment-driven settings for the importer binary.

mod settings;

pub use settings::{
    ConfigError, DatabaseSettings, ImporterConfig, ProviderSettings, RunSettings, Secret,
    parse_actions,
};
