//! Raw event payloads as returned by each provider.
//!
//! [`RawEvent`] is a tagged union keyed by provider kind. Each variant mirrors
//! the provider's JSON shape closely enough to deserialize API responses
//! directly, and keeps every field it does not model in an `extra` map so the
//! payload can be written back unchanged.

use calsync_core::ProviderKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A provider payload before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", content = "payload", rename_all = "snake_case")]
pub enum RawEvent {
    Google(GoogleEvent),
    Outlook(OutlookEvent),
}

impl RawEvent {
    /// Returns the provider this payload came from.
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Google(_) => ProviderKind::Google,
            Self::Outlook(_) => ProviderKind::Outlook,
        }
    }

    /// Returns the provider-assigned event id.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Google(event) => event.id.as_deref(),
            Self::Outlook(event) => event.id.as_deref(),
        }
    }

    /// Returns true if the provider marks this event as cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Google(event) => event.status.as_deref() == Some("cancelled"),
            Self::Outlook(event) => event.is_cancelled.unwrap_or(false),
        }
    }
}

// Google Calendar v3

/// An event resource from the Google Calendar API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub start: GoogleEventTime,
    #[serde(default)]
    pub end: GoogleEventTime,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<GoogleAttendee>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hangout_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conference_data: Option<GoogleConferenceData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Start or end of a Google event.
///
/// Timed events carry `dateTime`; all-day events carry `date`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEventTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleAttendee {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleConferenceData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<GoogleEntryPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEntryPoint {
    #[serde(default)]
    pub entry_point_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

// Microsoft Graph

/// An event resource from Microsoft Graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<OutlookBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    #[serde(default)]
    pub start: OutlookDateTime,
    #[serde(default)]
    pub end: OutlookDateTime,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_cancelled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<OutlookLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<OutlookAttendee>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<OutlookRecipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_meeting: Option<OutlookOnlineMeeting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_meeting_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_link: Option<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Graph `dateTimeTimeZone`: a local wall-clock value plus a zone name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookDateTime {
    #[serde(default)]
    pub date_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookBody {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookEmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookRecipient {
    #[serde(default)]
    pub email_address: OutlookEmailAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookAttendee {
    #[serde(default)]
    pub email_address: OutlookEmailAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OutlookResponseStatus>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub attendee_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookResponseStatus {
    #[serde(default)]
    pub response: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookOnlineMeeting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_url: Option<String>,
}
