//! CLI error types.

use calsync_core::TracingError;
use calsync_engine::EngineError;
use calsync_providers::ProviderError;
use thiserror::Error;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that can occur in the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Engine error.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Provider error raised while wiring accounts.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Output could not be encoded.
    #[error("failed to encode output: {0}")]
    Output(#[from] serde_json::Error),

    /// Logging could not be set up.
    #[error(transparent)]
    Tracing(#[from] TracingError),
}

impl CliError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::Engine(e) => e.code(),
            Self::Provider(e) => e.code().as_str(),
            Self::Io(_) => "io",
            Self::Output(_) => "output",
            Self::Tracing(_) => "tracing",
        }
    }
}
