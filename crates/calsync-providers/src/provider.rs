//! The per-account adapter contract.
//!
//! One [`EventProvider`] instance serves one connected account. The trait is
//! object safe so the engine can hold `Arc<dyn EventProvider>` for every
//! account regardless of provider kind.

use std::future::Future;
use std::pin::Pin;

use calsync_core::{AccountId, EventDraft, ProviderKind, TimeWindow};
use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalEvent;
use crate::error::{ProviderError, ProviderResult};
use crate::normalize::{LocalContext, normalize_event};
use crate::raw_event::RawEvent;

/// One calendar of an account, as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_primary: bool,
    /// IANA or Windows zone name, as reported.
    pub timezone: Option<String>,
    pub color: Option<String>,
}

impl CalendarInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            is_primary: false,
            timezone: None,
            color: None,
        }
    }

    pub fn with_primary(mut self, is_primary: bool) -> Self {
        self.is_primary = is_primary;
        self
    }
}

/// Who the account belongs to, as reported by `test_connection`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub timezone: Option<String>,
}

/// Keeps [`EventProvider`] usable as `dyn`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// API client for one account on one provider.
///
/// Every network method maps HTTP failures onto
/// [`ProviderErrorCode`](crate::ProviderErrorCode) the same way: 401 is
/// `AuthExpired`, 403 `PermissionDenied`, 429 `RateLimited`, 408 `Timeout`,
/// other 4xx `InvalidRequest`, 5xx `NetworkError`.
pub trait EventProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn account_id(&self) -> &AccountId;

    /// The zone and clock used by [`normalize`](Self::normalize).
    fn local_context(&self) -> &LocalContext;

    /// Lists events intersecting the window, following pagination.
    fn list_events(&self, window: TimeWindow) -> BoxFuture<'_, ProviderResult<Vec<RawEvent>>>;

    fn get_event<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, ProviderResult<RawEvent>>;

    fn create_event<'a>(&'a self, draft: &'a EventDraft)
    -> BoxFuture<'a, ProviderResult<RawEvent>>;

    fn update_event<'a>(
        &'a self,
        event_id: &'a str,
        draft: &'a EventDraft,
    ) -> BoxFuture<'a, ProviderResult<RawEvent>>;

    fn delete_event<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, ProviderResult<()>>;

    fn list_calendars(&self) -> BoxFuture<'_, ProviderResult<Vec<CalendarInfo>>>;

    /// Cheap authenticated call used to verify the credential.
    fn test_connection(&self) -> BoxFuture<'_, ProviderResult<AccountProfile>>;

    /// Converts one of this provider's payloads into a canonical event.
    fn normalize(&self, raw: RawEvent, account_id: &AccountId) -> ProviderResult<CanonicalEvent> {
        if raw.kind() != self.kind() {
            return Err(ProviderError::internal(format!(
                "{} provider asked to normalize a {} payload",
                self.kind(),
                raw.kind()
            ))
            .with_provider(self.kind()));
        }
        normalize_event(raw, account_id, self.local_context())
    }
}

/// Fails every call with the same error.
///
/// Stands in for an account whose adapter could not be built (for example a
/// missing OAuth client id) so the account still shows up as disconnected.
#[derive(Debug)]
pub struct ErrorProvider {
    kind: ProviderKind,
    account_id: AccountId,
    local: LocalContext,
    error: ProviderError,
}

impl ErrorProvider {
    pub fn new(kind: ProviderKind, account_id: AccountId, error: ProviderError) -> Self {
        Self {
            kind,
            account_id,
            local: LocalContext::new(chrono_tz::Tz::UTC),
            error: error.with_provider(kind),
        }
    }

    fn fail<'a, T: Send + 'a>(&self) -> BoxFuture<'a, ProviderResult<T>> {
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }
}

impl EventProvider for ErrorProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    fn local_context(&self) -> &LocalContext {
        &self.local
    }

    fn list_events(&self, _window: TimeWindow) -> BoxFuture<'_, ProviderResult<Vec<RawEvent>>> {
        self.fail()
    }

    fn get_event<'a>(&'a self, _event_id: &'a str) -> BoxFuture<'a, ProviderResult<RawEvent>> {
        self.fail()
    }

    fn create_event<'a>(
        &'a self,
        _draft: &'a EventDraft,
    ) -> BoxFuture<'a, ProviderResult<RawEvent>> {
        self.fail()
    }

    fn update_event<'a>(
        &'a self,
        _event_id: &'a str,
        _draft: &'a EventDraft,
    ) -> BoxFuture<'a, ProviderResult<RawEvent>> {
        self.fail()
    }

    fn delete_event<'a>(&'a self, _event_id: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        self.fail()
    }

    fn list_calendars(&self) -> BoxFuture<'_, ProviderResult<Vec<CalendarInfo>>> {
        self.fail()
    }

    fn test_connection(&self) -> BoxFuture<'_, ProviderResult<AccountProfile>> {
        self.fail()
    }
}
