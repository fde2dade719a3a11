//! Microsoft Graph (Outlook / Exchange Online) adapter.
//!
//! Reads go through `calendarView`, which expands recurring series into
//! instances. Graph is asked to return times in UTC; values still come back
//! without an offset and with `timeZone: "UTC"`, which normalization treats
//! as authoritative.

use std::sync::Arc;
use std::time::Duration;

use calsync_core::{AccountId, EventDraft, ProviderKind, TimeWindow};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::credentials::CredentialStore;
use crate::error::{ProviderError, ProviderResult};
use crate::http::{ApiClient, DEFAULT_HTTP_TIMEOUT};
use crate::normalize::LocalContext;
use crate::provider::{AccountProfile, BoxFuture, CalendarInfo, EventProvider};
use crate::raw_event::{OutlookEvent, RawEvent};

/// Base URL for Microsoft Graph v1.0.
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const PAGE_SIZE: &str = "100";
const PREFER_UTC: &str = "outlook.timezone=\"UTC\"";
const GRAPH_DATETIME: &str = "%Y-%m-%dT%H:%M:%S";

/// Configuration for one Microsoft account.
#[derive(Debug, Clone)]
pub struct OutlookConfig {
    pub account_id: AccountId,
    /// Calendar to use; the mailbox default calendar when `None`.
    pub calendar_id: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub local: LocalContext,
}

impl OutlookConfig {
    pub fn new(account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
            calendar_id: None,
            base_url: GRAPH_API_BASE.to_string(),
            timeout: DEFAULT_HTTP_TIMEOUT,
            local: LocalContext::system(),
        }
    }

    pub fn with_calendar_id(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = Some(calendar_id.into());
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

/// Microsoft Graph provider for one account.
#[derive(Debug)]
pub struct OutlookProvider {
    config: OutlookConfig,
    api: ApiClient,
}

impl OutlookProvider {
    pub fn new(
        config: OutlookConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> ProviderResult<Self> {
        let api = ApiClient::new(
            ProviderKind::Outlook,
            &config.base_url,
            config.timeout,
            credentials,
        )?;
        Ok(Self { config, api })
    }

    /// `/me` or `/me/calendars/{id}`.
    fn calendar_root(&self) -> String {
        match self.config.calendar_id {
            Some(ref id) => format!("/me/calendars/{}", urlencoding::encode(id)),
            None => "/me".to_string(),
        }
    }

    fn event_path(&self, event_id: &str) -> String {
        format!("/me/events/{}", urlencoding::encode(event_id))
    }

    async fn fetch_events(&self, window: TimeWindow) -> ProviderResult<Vec<RawEvent>> {
        let mut events = Vec::new();
        let first = self
            .api
            .get(&format!("{}/calendarView", self.calendar_root()))
            .query(&[
                (
                    "startDateTime",
                    window.start.format(GRAPH_DATETIME).to_string(),
                ),
                ("endDateTime", window.end.format(GRAPH_DATETIME).to_string()),
                ("$top", PAGE_SIZE.to_string()),
            ]);
        let mut request = Some(first);

        while let Some(next) = request.take() {
            let page: GraphPage<OutlookEvent> = self
                .api
                .send_json(next.header("Prefer", PREFER_UTC))
                .await?;
            events.extend(page.value.into_iter().map(RawEvent::Outlook));
            request = page
                .next_link
                .as_deref()
                .map(|link| self.api.get_absolute(link));
        }

        debug!(
            account = %self.config.account_id,
            count = events.len(),
            "fetched outlook events"
        );
        Ok(events)
    }

    async fn fetch_calendars(&self) -> ProviderResult<Vec<CalendarInfo>> {
        let mut calendars = Vec::new();
        let mut request = Some(self.api.get("/me/calendars"));

        while let Some(next) = request.take() {
            let page: GraphPage<GraphCalendar> = self.api.send_json(next).await?;
            calendars.extend(page.value.into_iter().map(|cal| CalendarInfo {
                id: cal.id,
                name: cal.name,
                description: None,
                is_primary: cal.is_default_calendar,
                timezone: None,
                color: cal.hex_color.filter(|c| !c.is_empty()).or(cal.color),
            }));
            request = page
                .next_link
                .as_deref()
                .map(|link| self.api.get_absolute(link));
        }
        Ok(calendars)
    }
}

/// Builds the Graph event body for create and update.
fn draft_body(draft: &EventDraft) -> ProviderResult<serde_json::Value> {
    draft.validate().map_err(ProviderError::invalid_request)?;

    let (start, end) = if draft.all_day {
        (
            draft.start.date_naive().and_time(chrono::NaiveTime::MIN),
            draft.end.date_naive().and_time(chrono::NaiveTime::MIN),
        )
    } else {
        (draft.start.naive_utc(), draft.end.naive_utc())
    };

    let attendees: Vec<_> = draft
        .attendees
        .iter()
        .map(|email| json!({ "emailAddress": { "address": email }, "type": "required" }))
        .collect();

    let mut body = json!({
        "subject": draft.title,
        "start": { "dateTime": start.format(GRAPH_DATETIME).to_string(), "timeZone": "UTC" },
        "end": { "dateTime": end.format(GRAPH_DATETIME).to_string(), "timeZone": "UTC" },
        "isAllDay": draft.all_day,
        "attendees": attendees,
    });
    if let Some(ref description) = draft.description {
        body["body"] = json!({ "contentType": "text", "content": description });
    }
    if let Some(ref location) = draft.location {
        body["location"] = json!({ "displayName": location });
    }
    Ok(body)
}

impl EventProvider for OutlookProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
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
            let request = self
                .api
                .get(&self.event_path(event_id))
                .header("Prefer", PREFER_UTC);
            let event: OutlookEvent = self.api.send_json(request).await?;
            Ok(RawEvent::Outlook(event))
        })
    }

    fn create_event<'a>(
        &'a self,
        draft: &'a EventDraft,
    ) -> BoxFuture<'a, ProviderResult<RawEvent>> {
        Box::pin(async move {
            let body = draft_body(draft).map_err(|e| e.with_provider(ProviderKind::Outlook))?;
            let request = self
                .api
                .post(&format!("{}/events", self.calendar_root()))
                .header("Prefer", PREFER_UTC)
                .json(&body);
            let event: OutlookEvent = self.api.send_json(request).await?;
            Ok(RawEvent::Outlook(event))
        })
    }

    fn update_event<'a>(
        &'a self,
        event_id: &'a str,
        draft: &'a EventDraft,
    ) -> BoxFuture<'a, ProviderResult<RawEvent>> {
        Box::pin(async move {
            let body = draft_body(draft).map_err(|e| e.with_provider(ProviderKind::Outlook))?;
            let request = self
                .api
                .patch(&self.event_path(event_id))
                .header("Prefer", PREFER_UTC)
                .json(&body);
            let event: OutlookEvent = self.api.send_json(request).await?;
            Ok(RawEvent::Outlook(event))
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
            let me: GraphUser = self.api.send_json(self.api.get("/me")).await?;
            Ok(AccountProfile {
                email: me.mail.or(me.user_principal_name),
                display_name: me.display_name,
                timezone: None,
            })
        })
    }
}

#[derive(Debug, Deserialize)]
struct GraphPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphCalendar {
    id: String,
    #[serde(default)]
    name: String,
    color: Option<String>,
    hex_color: Option<String>,
    #[serde(default)]
    is_default_calendar: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    mail: Option<String>,
    user_principal_name: Option<String>,
    display_name: Option<String>,
}
