//! Configuration for Strata.
//!
//! Settings persist to disk as RON, can be overridden from the command line
//! via clap, and support hot-reload detection. Every section is
//! `#[serde(default)]`, so older and newer files both load.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{CONFIG_FILE, Config, DebugConfig, EditConfig, WorldConfig, default_config_dir};
pub use error::ConfigError;
