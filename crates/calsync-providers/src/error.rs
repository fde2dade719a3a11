//! What went wrong talking to Google or Outlook.
//!
//! Every adapter call, credential store access and lease refresh reports a
//! [`ProviderError`]. Errors are cheap to clone so a single failure can be
//! handed to every waiter of a shared cache fill or batched request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use calsync_core::ProviderKind;
use serde::Serialize;
use thiserror::Error;

/// Machine-readable failure category. Drives retry decisions and becomes the
/// `reason` of a disconnected account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorCode {
    /// The access credential is missing, expired or was rejected (401).
    AuthExpired,
    /// Too many requests (429).
    RateLimited,
    /// Connection failure or 5xx from the provider.
    NetworkError,
    /// The account lacks permission for the operation (403).
    PermissionDenied,
    /// The request was rejected as malformed (4xx other than the above).
    InvalidRequest,
    /// The request or job did not complete in time.
    Timeout,
    /// Retries were exhausted.
    PermanentFailure,
    /// The provider answered with a body that could not be decoded.
    InvalidResponse,
    /// The resource does not exist (404).
    NotFound,
    /// Missing or invalid local configuration.
    Configuration,
    /// Unexpected internal state.
    Internal,
}

impl ProviderErrorCode {
    /// `AuthExpired` counts as transient: a lease refresh may have renewed
    /// the token before the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::NetworkError | Self::Timeout | Self::AuthExpired
        )
    }

    /// Whether sending the identical request again can succeed. `AuthExpired`
    /// needs a new credential first, so only a caller holding the lease
    /// scheduler retries it.
    pub fn can_resend(&self) -> bool {
        self.is_retryable() && *self != Self::AuthExpired
    }

    /// A refresh that failed with one of these needs the user to re-authorize.
    pub fn is_terminal_for_refresh(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired | Self::PermissionDenied | Self::InvalidRequest
        )
    }

    pub fn disconnects_account(&self) -> bool {
        matches!(self, Self::AuthExpired | Self::PermissionDenied)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthExpired => "auth_expired",
            Self::RateLimited => "rate_limited",
            Self::NetworkError => "network_error",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidRequest => "invalid_request",
            Self::Timeout => "timeout",
            Self::PermanentFailure => "permanent_failure",
            Self::InvalidResponse => "invalid_response",
            Self::NotFound => "not_found",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed adapter call, credential access or token refresh.
#[derive(Debug, Clone, Error)]
pub struct ProviderError {
    code: ProviderErrorCode,
    message: String,
    provider: Option<ProviderKind>,
    /// Server-provided hint for when to retry (from `Retry-After`).
    retry_after: Option<Duration>,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider: None,
            retry_after: None,
            source: None,
        }
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::AuthExpired, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::RateLimited, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::NetworkError, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::PermissionDenied, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InvalidRequest, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::Timeout, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::PermanentFailure, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InvalidResponse, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::NotFound, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::Configuration, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::Internal, message)
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Attaches a retry-after hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn code(&self) -> ProviderErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn provider(&self) -> Option<ProviderKind> {
        self.provider
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn can_resend(&self) -> bool {
        self.code.can_resend()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(provider) = self.provider {
            write!(f, "[{provider}] ")?;
        }
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(retry_after) = self.retry_after {
            write!(f, " (retry after {}s)", retry_after.as_secs())?;
        }
        Ok(())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes() {
        assert!(ProviderErrorCode::NetworkError.is_retryable());
        assert!(ProviderErrorCode::RateLimited.is_retryable());
        assert!(ProviderErrorCode::Timeout.is_retryable());
        assert!(ProviderErrorCode::AuthExpired.is_retryable());
        assert!(!ProviderErrorCode::PermissionDenied.is_retryable());
        assert!(!ProviderErrorCode::InvalidRequest.is_retryable());
        assert!(!ProviderErrorCode::InvalidResponse.is_retryable());
        assert!(!ProviderErrorCode::Configuration.is_retryable());
    }

    #[test]
    fn expired_credential_is_not_resent_as_is() {
        assert!(!ProviderErrorCode::AuthExpired.can_resend());
        assert!(!ProviderErrorCode::PermissionDenied.can_resend());
        assert!(ProviderErrorCode::NetworkError.can_resend());
        assert!(ProviderError::rate_limited("slow down").can_resend());
    }

    #[test]
    fn refresh_terminal_codes() {
        assert!(ProviderErrorCode::AuthExpired.is_terminal_for_refresh());
        assert!(ProviderErrorCode::PermissionDenied.is_terminal_for_refresh());
        assert!(ProviderErrorCode::InvalidRequest.is_terminal_for_refresh());
        assert!(!ProviderErrorCode::NetworkError.is_terminal_for_refresh());
    }

    #[test]
    fn error_code_names() {
        assert_eq!(ProviderErrorCode::AuthExpired.as_str(), "auth_expired");
        assert_eq!(ProviderErrorCode::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn display_includes_provider_and_hint() {
        let err = ProviderError::rate_limited("too many requests")
            .with_provider(ProviderKind::Outlook)
            .with_retry_after(Duration::from_secs(30));
        let display = err.to_string();
        assert!(display.contains("[outlook]"));
        assert!(display.contains("rate_limited"));
        assert!(display.contains("retry after 30s"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn clone_keeps_source() {
        use std::error::Error;
        let err = ProviderError::internal("credentials file unwritable")
            .with_source(std::io::Error::other("read-only filesystem"));
        let cloned = err.clone();
        assert!(cloned.source().is_some());
        assert_eq!(cloned.code(), ProviderErrorCode::Internal);
    }
}
