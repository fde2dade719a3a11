//! Event-side types shared by every crate in the workspace.
//!
//! - [`ProviderKind`]: which external service an account, lease or event comes from
//! - [`AccountId`]: the identifier of one connected account
//! - [`Attendee`] / [`AttendeeStatus`]: attendee information in canonical form
//! - [`EventDraft`]: the caller-side payload for creating or updating events
//! - [`Priority`]: admission order for sync jobs and batched requests

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The external service an account is hosted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Google Calendar (Calendar API v3).
    Google,
    /// Microsoft Outlook / Exchange Online (Microsoft Graph).
    Outlook,
}

impl ProviderKind {
    /// All provider kinds known to the workspace.
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Google, ProviderKind::Outlook];

    /// Returns the stable lowercase name used in cache keys, logs and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Outlook => "outlook",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown provider name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider kind: {0}")]
pub struct UnknownProviderKind(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProviderKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" | "gcal" => Ok(Self::Google),
            "outlook" | "microsoft" | "graph" => Ok(Self::Outlook),
            other => Err(UnknownProviderKind(other.to_string())),
        }
    }
}

/// Admission priority. `High` sorts first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a connected account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Creates an account id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for AccountId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The response status of an event attendee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendeeStatus {
    /// The attendee has accepted the invitation.
    Accepted,
    /// The attendee has declined the invitation.
    Declined,
    /// The attendee has tentatively accepted.
    Tentative,
    /// The attendee has not responded.
    NeedsAction,
    /// The attendee organizes the event.
    Organizer,
    /// Unknown response status.
    #[default]
    Unknown,
}

/// An attendee of a canonical event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    /// The attendee's email address.
    pub email: String,
    /// The attendee's display name, if the provider reported one.
    pub name: Option<String>,
    /// The attendee's response status.
    pub status: AttendeeStatus,
}

impl Attendee {
    /// Creates an attendee with an unknown response status.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
            status: AttendeeStatus::Unknown,
        }
    }

    /// Builder method to set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder method to set the response status.
    pub fn with_status(mut self, status: AttendeeStatus) -> Self {
        self.status = status;
        self
    }
}

/// Payload for creating or updating an event on a provider.
///
/// For all-day drafts only the date component of `start` / `end` is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Event title.
    pub title: String,
    /// Free-text description.
    pub description: Option<String>,
    /// Start instant.
    pub start: DateTime<Utc>,
    /// End instant.
    pub end: DateTime<Utc>,
    /// Whether the event spans whole days.
    pub all_day: bool,
    /// Location text.
    pub location: Option<String>,
    /// Invitee email addresses.
    pub attendees: Vec<String>,
}

impl EventDraft {
    /// Creates a timed draft.
    pub fn new(title: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            description: None,
            start,
            end,
            all_day: false,
            location: None,
            attendees: Vec::new(),
        }
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder method to set the location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Builder method to mark the draft as all-day.
    pub fn with_all_day(mut self, all_day: bool) -> Self {
        self.all_day = all_day;
        self
    }

    /// Builder method to add an invitee.
    pub fn with_attendee(mut self, email: impl Into<String>) -> Self {
        self.attendees.push(email.into());
        self
    }

    /// Returns an error message if the draft cannot be sent to a provider.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("event title must not be empty".to_string());
        }
        if self.end < self.start {
            return Err(format!(
                "event end {} is before start {}",
                self.end.to_rfc3339(),
                self.start.to_rfc3339()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn provider_kind_parse_and_display() {
        assert_eq!("google".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert_eq!(" Microsoft ".parse::<ProviderKind>().unwrap(), ProviderKind::Outlook);
        assert!("caldav".parse::<ProviderKind>().is_err());
        assert_eq!(ProviderKind::Outlook.to_string(), "outlook");
    }

    #[test]
    fn provider_kind_serde() {
        let json = serde_json::to_string(&ProviderKind::Google).unwrap();
        assert_eq!(json, "\"google\"");
        let parsed: ProviderKind = serde_json::from_str("\"outlook\"").unwrap();
        assert_eq!(parsed, ProviderKind::Outlook);
    }

    #[test]
    fn priority_orders_high_first() {
        let mut all = vec![Priority::Low, Priority::High, Priority::Medium];
        all.sort();
        assert_eq!(all, vec![Priority::High, Priority::Medium, Priority::Low]);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn account_id_is_transparent() {
        let id = AccountId::new("work");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"work\"");
        assert_eq!(id.as_str(), "work");
    }

    #[test]
    fn draft_validation() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap();

        assert!(EventDraft::new("Standup", start, end).validate().is_ok());
        assert!(EventDraft::new("  ", start, end).validate().is_err());

        let err = EventDraft::new("Backwards", end, start).validate().unwrap_err();
        assert!(err.contains("before start"));
    }

    #[test]
    fn draft_json_shape() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let draft = EventDraft::new("Review", start, start + chrono::Duration::minutes(30))
            .with_location("Room 4")
            .with_attendee("ana@example.com");
        insta::assert_json_snapshot!(draft, @r#"
        {
          "title": "Review",
          "description": null,
          "start": "2025-03-01T10:00:00Z",
          "end": "2025-03-01T10:30:00Z",
          "all_day": false,
          "location": "Room 4",
          "attendees": [
            "ana@example.com"
          ]
        }
        "#);
    }
}
