//! calsync command line: config file, sync daemon, one-shot queries.
//!
//! This crate provides the `calsync` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod secret;
pub mod signals;

pub use cli::Cli;
pub use config::CliConfig;
pub use error::{CliError, CliResult};
