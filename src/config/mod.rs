//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the storage path, the
//! generation horizon, the worker pool, retries and the sweep trigger.

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use types::{
    AppConfig, DEFAULT_DATABASE, DispatchConfig, IN_MEMORY_DATABASE, SweepConfig, WorkersConfig,
};
