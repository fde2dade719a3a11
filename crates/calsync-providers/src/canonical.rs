//! The provider-independent event shape handed to callers and stored in the cache.

use calsync_core::{AccountId, Attendee, ProviderKind, TimeWindow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::raw_event::RawEvent;

/// A normalized event.
///
/// Invariant: `start_time <= end_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: String,
    pub provider_kind: ProviderKind,
    pub account_id: AccountId,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub all_day: bool,
    pub location: Option<String>,
    pub attendees: Vec<Attendee>,
    pub online_meeting_url: Option<String>,
    /// The payload as received, for round-trip writes.
    pub raw_provider_payload: RawEvent,
}

impl CanonicalEvent {
    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// Returns true if the event intersects the window.
    pub fn overlaps(&self, window: &TimeWindow) -> bool {
        window.overlaps(self.start_time, self.end_time)
    }

    /// Sort key used when merging events from several accounts.
    pub fn sort_key(&self) -> (DateTime<Utc>, DateTime<Utc>, &str) {
        (self.start_time, self.end_time, self.id.as_str())
    }
}
