//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Core config struct definitions, one section per service
//! - [`defaults`]: Default values for every recognized option
//! - [`validation`]: Startup validation collecting all errors at once

mod defaults;
mod types;
mod validation;

pub use types::{
    AgentConfig, Config, DatabaseConfig, DirectorConfig, LogFormat, SchemaConfig, ServerConfig,
    StateConfig,
};
pub use validation::validate;
