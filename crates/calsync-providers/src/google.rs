//! Google Calendar (API v3) adapter.

use std::sync::Arc;
use std::time::Duration;

use calsync_core::{AccountId, EventDraft, ProviderKind, TimeWindow};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::credentials::CredentialStore;
use crate::error::{ProviderError, ProviderResult};
use crate::http::{ApiClient, DEFAULT_HTTP_TIMEOUT};
use crate::normalize::LocalContext;
use crate::provider::{AccountProfile, BoxFuture, CalendarInfo, EventProvider};
use crate::raw_event::{GoogleEvent, RawEvent};

/// Base URL for Google Calendar API v3.
pub const GOOGLE_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

/// Page size requested from `events.list`.
const PAGE_SIZE: &str = "250";

/// Configuration for one Google account.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub account_id: AccountId,
    /// Calendar to read and write; `primary` by default.
    pub calendar_id: String,
    pub base_url: String,
    pub timeout: Duration,
    pub local: LocalContext,
}

impl GoogleConfig {
    pub fn new(account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
            calendar_id: "primary".to_string(),
            base_url: GOOGLE_API_BASE.to_string(),
            timeout: DEFAULT_HTTP_TIMEOUT,
            local: LocalContext::system(),
        }
    }

    pub fn with_calendar_id(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = calendar_id.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_local_context(mut self, local: LocalContext) -> Self {
        self.local = local;
        self
    }
}

/// Google Calendar provider for one account.
#[derive(Debug)]
pub struct GoogleProvider {
    config: GoogleConfig,
    api: ApiClient,
}

impl GoogleProvider {
    pub fn new(config: GoogleConfig, credentials: Arc<dyn CredentialStore>) -> ProviderResult<Self> {
        let api = ApiClient::new(
            ProviderKind::Google,
            &config.base_url,
            config.timeout,
            credentials,
        )?;
        Ok(Self { config, api })
    }

    fn events_path(&self) -> String {
        format!(
            "/calendars/{}/events",
            urlencoding::encode(&self.config.calendar_id)
        )
    }

    fn event_path(&self, event_id: &str) -> String {
        format!("{}/{}", self.events_path(), urlencoding::encode(event_id))
    }

    async fn fetch_events(&self, window: TimeWindow) -> ProviderResult<Vec<RawEvent>> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.api.get(&self.events_path()).query(&[
                ("timeMin", window.start.to_rfc3339()),
                ("timeMax", window.end.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
            ]);
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: EventListResponse = self.api.send_json(request).await?;
            events.extend(page.items.into_iter().map(RawEvent::Google));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(
            account = %self.config.account_id,
            calendar = %self.config.calendar_id,
            count = events.len(),
            "fetched google events"
        );
        Ok(events)
    }

    async fn fetch_calendars(&self) -> ProviderResult<Vec<CalendarInfo>> {
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.api.get("/users/me/calendarList");
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: CalendarListResponse = self.api.send_json(request).await?;
            calendars.extend(page.items.into_iter().map(|entry| CalendarInfo {
                id: entry.id,
                name: entry.summary_override.or(entry.summary).unwrap_or_default(),
                description: entry.description,
                is_primary: entry.primary,
                timezone: entry.time_zone,
                color: entry.background_color,
            }));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(calendars)
    }
}

/// Builds the `events.insert` / `events.patch` body.
fn draft_body(draft: &EventDraft) -> ProviderResult<serde_json::Value> {
    draft.validate().map_err(ProviderError::invalid_request)?;

    let (start, end) = if draft.all_day {
        (
            json!({ "date": draft.start.date_naive().to_string() }),
            json!({ "date": draft.end.date_naive().to_string() }),
        )
    } else {
        (
            json!({ "dateTime": draft.start.to_rfc3339() }),
            json!({ "dateTime": draft.end.to_rfc3339() }),
        )
    };

    let attendees: Vec<_> = draft
        .attendees
        .iter()
        .map(|email| json!({ "email": email }))
        .collect();

    let mut body = json!({
        "summary": draft.title,
        "start": start,
        "end": end,
        "attendees": attendees,
    });
    if let Some(ref description) = draft.description {
        body["description"] = json!(description);
    }
    if let Some(ref location) = draft.location {
        body["location"] = json!(location);
    }
    Ok(body)
}

impl EventProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn account_id(&self) -> &AccountId {
        &self.config.account_id
    }

    fn local_context(&self) -> &LocalContext {
        &self.config.local
    }

    fn list_events(&self, window: TimeWindow) -> BoxFuture<'_, ProviderResult<Vec<RawEvent>>> {
        Box::pin(self.fetch_events(window))
    }

    fn get_event<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, ProviderResult<RawEvent>> {
        Box::pin(async move {
            let event: GoogleEvent = self
                .api
                .send_json(self.api.get(&self.event_path(event_id)))
                .await?;
            Ok(RawEvent::Google(event))
        })
    }

    fn create_event<'a>(
        &'a self,
        draft: &'a EventDraft,
    ) -> BoxFuture<'a, ProviderResult<RawEvent>> {
        Box::pin(async move {
            let body = draft_body(draft).map_err(|e| e.with_provider(ProviderKind::Google))?;
            let event: GoogleEvent = self
                .api
                .send_json(self.api.post(&self.events_path()).json(&body))
                .await?;
            Ok(RawEvent::Google(event))
        })
    }

    fn update_event<'a>(
        &'a self,
        event_id: &'a str,
        draft: &'a EventDraft,
    ) -> BoxFuture<'a, ProviderResult<RawEvent>> {
        Box::pin(async move {
            let body = draft_body(draft).map_err(|e| e.with_provider(ProviderKind::Google))?;
            let event: GoogleEvent = self
                .api
                .send_json(self.api.patch(&self.event_path(event_id)).json(&body))
                .await?;
            Ok(RawEvent::Google(event))
        })
    }

    fn delete_event<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.api
                .send_empty(self.api.delete(&self.event_path(event_id)))
                .await
        })
    }

    fn list_calendars(&self) -> BoxFuture<'_, ProviderResult<Vec<CalendarInfo>>> {
        Box::pin(self.fetch_calendars())
    }

    fn test_connection(&self) -> BoxFuture<'_, ProviderResult<AccountProfile>> {
        Box::pin(async move {
            let primary: CalendarResource = self
                .api
                .send_json(self.api.get("/calendars/primary"))
                .await?;
            Ok(AccountProfile {
                email: Some(primary.id),
                display_name: primary.summary,
                timezone: primary.time_zone,
            })
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListResponse {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListResponse {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListEntry {
    id: String,
    summary: Option<String>,
    summary_override: Option<String>,
    description: Option<String>,
    #[serde(default)]
    primary: bool,
    time_zone: Option<String>,
    background_color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarResource {
    id: String,
    summary: Option<String>,
    time_zone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderErrorCode;
    use crate::credentials::{CredentialLease, MemoryCredentialStore};
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;

    fn provider(server: &mockito::Server) -> GoogleProvider {
        let store = Arc::new(MemoryCredentialStore::new().with_lease(CredentialLease::new(
            ProviderKind::Google,
            "g-token",
            Utc::now() + chrono::Duration::hours(1),
        )));
        let config = GoogleConfig::new("work")
            .with_base_url(server.url())
            .with_local_context(LocalContext::fixed(
                chrono_tz::America::New_York,
                Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap(),
            ));
        GoogleProvider::new(config, store).unwrap()
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn list_events_follows_pages() {
        let mut server = mockito::Server::new_async().await;
        let second = server
            .mock("GET", "/calendars/primary/events")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_status(200)
            .with_body(
                r#"{"items": [{"id": "b", "start": {"dateTime": "2024-01-15T12:00:00Z"},
                    "end": {"dateTime": "2024-01-15T13:00:00Z"}}]}"#,
            )
            .create_async()
            .await;
        let first = server
            .mock("GET", "/calendars/primary/events")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("singleEvents".into(), "true".into()),
                Matcher::Regex("timeMin=2024-01-15".into()),
                // first page carries no pageToken, which would follow maxResults
                Matcher::Regex("maxResults=250$".into()),
            ]))
            .match_header("authorization", "Bearer g-token")
            .with_status(200)
            .with_body(
                r#"{"items": [{"id": "a", "start": {"dateTime": "2024-01-15T10:00:00"},
                    "end": {"dateTime": "2024-01-15T11:00:00"}}], "nextPageToken": "p2"}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let provider = provider(&server);
        let raws = provider.list_events(window()).await.unwrap();
        assert_eq!(raws.len(), 2);

        let first_event = provider
            .normalize(raws[0].clone(), provider.account_id())
            .unwrap();
        assert_eq!(
            first_event.start_time,
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
        );

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn status_codes_map_to_taxonomy() {
        let mut server = mockito::Server::new_async().await;
        let _unauthorized = server
            .mock("GET", "/calendars/primary")
            .with_status(401)
            .create_async()
            .await;
        let _rate_limited = server
            .mock("GET", "/users/me/calendarList")
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;
        let _server_error = server
            .mock("GET", "/calendars/primary/events/x")
            .with_status(503)
            .create_async()
            .await;
        let _forbidden = server
            .mock("DELETE", "/calendars/primary/events/y")
            .with_status(403)
            .create_async()
            .await;

        let provider = provider(&server);

        let err = provider.test_connection().await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::AuthExpired);

        let err = provider.list_calendars().await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = provider.get_event("x").await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::NetworkError);

        let err = provider.delete_event("y").await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn create_event_sends_draft() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/calendars/primary/events")
            .match_body(Matcher::PartialJson(json!({
                "summary": "Retro",
                "start": {"dateTime": "2024-01-15T10:00:00+00:00"},
                "attendees": [{"email": "ana@example.com"}]
            })))
            .with_status(200)
            .with_body(
                r#"{"id": "new1", "summary": "Retro",
                    "start": {"dateTime": "2024-01-15T10:00:00Z"},
                    "end": {"dateTime": "2024-01-15T11:00:00Z"}}"#,
            )
            .create_async()
            .await;

        let provider = provider(&server);
        let draft = EventDraft::new(
            "Retro",
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap(),
        )
        .with_attendee("ana@example.com");

        let raw = provider.create_event(&draft).await.unwrap();
        assert_eq!(raw.id(), Some("new1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn invalid_draft_is_rejected_locally() {
        let server = mockito::Server::new_async().await;
        let provider = provider(&server);
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let draft = EventDraft::new("", at, at);

        let err = provider.create_event(&draft).await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn calendars_and_profile() {
        let mut server = mockito::Server::new_async().await;
        let _list = server
            .mock("GET", "/users/me/calendarList")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r##"{"items": [
                    {"id": "me@example.com", "summary": "Me", "primary": true,
                     "timeZone": "America/New_York", "backgroundColor": "#9fe1e7"},
                    {"id": "team@group", "summary": "Team", "summaryOverride": "Team (shared)"}
                ]}"##,
            )
            .create_async()
            .await;
        let _primary = server
            .mock("GET", "/calendars/primary")
            .with_status(200)
            .with_body(r#"{"id": "me@example.com", "summary": "Me", "timeZone": "America/New_York"}"#)
            .create_async()
            .await;

        let provider = provider(&server);
        let calendars = provider.list_calendars().await.unwrap();
        assert_eq!(calendars.len(), 2);
        assert!(calendars[0].is_primary);
        assert_eq!(calendars[0].color.as_deref(), Some("#9fe1e7"));
        assert_eq!(calendars[1].name, "Team (shared)");

        let profile = provider.test_connection().await.unwrap();
        assert_eq!(profile.email.as_deref(), Some("me@example.com"));
        assert_eq!(profile.timezone.as_deref(), Some("America/New_York"));
    }
}
