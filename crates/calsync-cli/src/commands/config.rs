//! Configuration commands.

use std::path::Path;

use crate::config::CliConfig;
use crate::error::{CliError, CliResult};

/// Prints the effective configuration, defaults included, as TOML.
pub fn dump(config: &CliConfig, path: &Path) -> CliResult<()> {
    let rendered = toml::to_string_pretty(config)
        .map_err(|e| CliError::config(format!("failed to serialize config: {e}")))?;
    println!("# {}", path.display());
    println!("{rendered}");
    Ok(())
}

/// Checks the configuration, including secret references.
pub fn validate(config: &CliConfig) -> CliResult<()> {
    config.validate()?;
    println!(
        "Configuration is valid ({} account{}).",
        config.accounts.len(),
        if config.accounts.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

/// Prints the configuration and credential file locations.
pub fn path(config: &CliConfig, path: &Path) -> CliResult<()> {
    println!("config: {}", path.display());
    println!("credentials: {}", config.credentials_path().display());
    Ok(())
}
