//! Renewal of credential leases.
//!
//! The lease scheduler calls a [`LeaseRefresher`] shortly before a lease
//! expires. [`OAuthRefresher`] implements the OAuth 2.0 refresh-token grant
//! (RFC 6749 section 6).

use std::time::Duration;

use calsync_core::ProviderKind;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use crate::credentials::CredentialLease;
use crate::error::{ProviderError, ProviderResult};
use crate::http::{DEFAULT_HTTP_TIMEOUT, classify_status, classify_transport};
use crate::provider::BoxFuture;

/// Google OAuth 2.0 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Microsoft identity platform token endpoint (multi-tenant).
pub const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// Exchanges a lease for a fresh one.
pub trait LeaseRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        lease: &'a CredentialLease,
    ) -> BoxFuture<'a, ProviderResult<CredentialLease>>;
}

/// OAuth client registration.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_url: String,
    pub timeout: Duration,
}

impl OAuthClientConfig {
    pub fn new(client_id: impl Into<String>, token_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            token_url: token_url.into(),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Registration against the provider's public token endpoint.
    pub fn for_provider(kind: ProviderKind, client_id: impl Into<String>) -> Self {
        let token_url = match kind {
            ProviderKind::Google => GOOGLE_TOKEN_URL,
            ProviderKind::Outlook => MICROSOFT_TOKEN_URL,
        };
        Self::new(client_id, token_url)
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }
}

/// Refresh-token grant against a token endpoint.
#[derive(Debug)]
pub struct OAuthRefresher {
    kind: ProviderKind,
    config: OAuthClientConfig,
    http: reqwest::Client,
}

impl OAuthRefresher {
    pub fn new(kind: ProviderKind, config: OAuthClientConfig) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                ProviderError::configuration(format!("failed to build HTTP client: {}", e))
                    .with_provider(kind)
            })?;
        Ok(Self { kind, config, http })
    }

    async fn exchange(&self, lease: &CredentialLease) -> ProviderResult<CredentialLease> {
        let refresh_token = lease.refresh_token.as_deref().ok_or_else(|| {
            ProviderError::auth_expired("lease has no refresh token").with_provider(self.kind)
        })?;

        let mut params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(ref secret) = self.config.client_secret {
            params.push(("client_secret", secret.as_str()));
        }
        let scope = lease.scopes.join(" ");
        if self.kind == ProviderKind::Outlook && !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }

        debug!(provider = %self.kind, url = %self.config.token_url, "refreshing access token");
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| classify_transport(self.kind, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(self.kind, e))?;

        if !status.is_success() {
            // invalid_grant comes back as 400: the refresh token is dead
            if status == StatusCode::BAD_REQUEST && body.contains("invalid_grant") {
                return Err(ProviderError::auth_expired(format!(
                    "refresh token rejected: {}",
                    body.trim()
                ))
                .with_provider(self.kind));
            }
            return Err(classify_status(self.kind, status, &headers, &body));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::invalid_response(format!("invalid token response: {}", e))
                .with_provider(self.kind)
        })?;

        let lifetime = token.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS);
        let scopes = match token.scope {
            Some(ref scope) => scope.split_whitespace().map(String::from).collect(),
            None => lease.scopes.clone(),
        };

        info!(provider = %self.kind, expires_in = lifetime, "refreshed access token");
        Ok(CredentialLease {
            kind: self.kind,
            access_token: token.access_token,
            // some servers rotate refresh tokens, others omit them
            refresh_token: token.refresh_token.or_else(|| lease.refresh_token.clone()),
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
            scopes,
        })
    }
}

impl LeaseRefresher for OAuthRefresher {
    fn refresh<'a>(
        &'a self,
        lease: &'a CredentialLease,
    ) -> BoxFuture<'a, ProviderResult<CredentialLease>> {
        Box::pin(self.exchange(lease))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}
