//! Engine error types.

use calsync_core::AccountId;
use calsync_providers::{ProviderError, ProviderErrorCode};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned by the aggregator and the engine services.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// No provider is registered for the account.
    #[error("Unknown account: {id}")]
    UnknownAccount { id: AccountId },

    /// Every retry attempt was used up.
    #[error("Gave up after {attempts} attempts: {last}")]
    PermanentFailure { attempts: u32, last: ProviderError },

    /// The service was stopped before the work could complete.
    #[error("Engine stopped")]
    Stopped,

    /// The request was cancelled while still queued.
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl EngineError {
    /// Creates an unknown account error.
    pub fn unknown_account(id: impl Into<AccountId>) -> Self {
        Self::UnknownAccount { id: id.into() }
    }

    /// Creates a permanent failure error.
    pub fn permanent(attempts: u32, last: ProviderError) -> Self {
        Self::PermanentFailure { attempts, last }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Provider(e) => e.code().as_str(),
            Self::UnknownAccount { .. } => "unknown_account",
            Self::PermanentFailure { .. } => "permanent_failure",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
            Self::Config { .. } => "configuration",
        }
    }

    /// Provider error code behind this error, if any.
    pub fn provider_code(&self) -> Option<ProviderErrorCode> {
        match self {
            Self::Provider(e) => Some(e.code()),
            Self::PermanentFailure { last, .. } => Some(last.code()),
            _ => None,
        }
    }
}
