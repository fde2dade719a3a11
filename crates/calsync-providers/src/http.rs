//! HTTP plumbing shared by the adapters.
//!
//! [`ApiClient`] attaches the current bearer token, sends the request and
//! maps every failure onto the provider error taxonomy.

use std::sync::Arc;
use std::time::Duration;

use calsync_core::ProviderKind;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::credentials::CredentialStore;
use crate::error::{ProviderError, ProviderResult};

/// Default per-request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Maps a non-success status to an error.
pub fn classify_status(
    kind: ProviderKind,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> ProviderError {
    let detail = if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    };
    let message = format!("HTTP {}: {}", status.as_u16(), detail.trim());

    let error = match status {
        StatusCode::UNAUTHORIZED => ProviderError::auth_expired(message),
        StatusCode::FORBIDDEN => ProviderError::permission_denied(message),
        StatusCode::NOT_FOUND => ProviderError::not_found(message),
        StatusCode::TOO_MANY_REQUESTS => {
            let error = ProviderError::rate_limited(message);
            match parse_retry_after(headers) {
                Some(after) => error.with_retry_after(after),
                None => error,
            }
        }
        StatusCode::REQUEST_TIMEOUT => ProviderError::timeout(message),
        s if s.is_client_error() => ProviderError::invalid_request(message),
        s if s.is_server_error() => {
            let error = ProviderError::network(message);
            match parse_retry_after(headers) {
                Some(after) => error.with_retry_after(after),
                None => error,
            }
        }
        _ => ProviderError::invalid_response(message),
    };
    error.with_provider(kind)
}

/// Maps a transport failure to an error.
pub fn classify_transport(kind: ProviderKind, err: reqwest::Error) -> ProviderError {
    let error = if err.is_timeout() {
        ProviderError::timeout(format!("request timed out: {}", err))
    } else if err.is_connect() {
        ProviderError::network(format!("connection failed: {}", err))
    } else if err.is_decode() {
        ProviderError::invalid_response(format!("failed to decode response: {}", err))
    } else {
        ProviderError::network(format!("request failed: {}", err))
    };
    error.with_provider(kind).with_source(err)
}

/// Reads `Retry-After` as whole seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Authenticated JSON client for one provider's REST API.
#[derive(Clone)]
pub struct ApiClient {
    kind: ProviderKind,
    base_url: String,
    http: reqwest::Client,
    credentials: Arc<dyn CredentialStore>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(
        kind: ProviderKind,
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: Arc<dyn CredentialStore>,
    ) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("calsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ProviderError::configuration(format!("failed to build HTTP client: {}", e))
                    .with_provider(kind)
            })?;

        Ok(Self {
            kind,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            credentials,
        })
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Joins `path` (which must start with `/`) onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path))
    }

    /// GET against an absolute URL, for server-provided continuation links.
    pub fn get_absolute(&self, url: &str) -> RequestBuilder {
        self.http.get(url)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.url(path))
    }

    pub fn patch(&self, path: &str) -> RequestBuilder {
        self.http.patch(self.url(path))
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.http.delete(self.url(path))
    }

    fn access_token(&self) -> ProviderResult<String> {
        let lease = self
            .credentials
            .retrieve(self.kind)
            .map_err(|e| e.with_provider(self.kind))?
            .ok_or_else(|| {
                ProviderError::auth_expired("no credential lease stored").with_provider(self.kind)
            })?;
        Ok(lease.access_token)
    }

    async fn execute(&self, request: RequestBuilder) -> ProviderResult<Response> {
        let token = self.access_token()?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| classify_transport(self.kind, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let error = classify_status(self.kind, status, &headers, &body);
        warn!(provider = %self.kind, status = status.as_u16(), code = %error.code(), "provider request failed");
        Err(error)
    }

    /// Sends the request and decodes a JSON body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ProviderResult<T> {
        let response = self.execute(request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(self.kind, e))?;

        serde_json::from_str(&body).map_err(|e| {
            debug!(provider = %self.kind, body_len = body.len(), "undecodable response body");
            ProviderError::invalid_response(format!("failed to parse response: {}", e))
                .with_provider(self.kind)
        })
    }

    /// Sends the request and discards the body.
    pub async fn send_empty(&self, request: RequestBuilder) -> ProviderResult<()> {
        self.execute(request).await.map(|_| ())
    }
}
