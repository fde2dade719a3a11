//! RawEvent to CanonicalEvent conversion.
//!
//! Providers do not agree on how they ship wall-clock values. Google usually
//! sends RFC 3339 strings with an offset; Graph sends a bare local value plus
//! a zone name, and several clients write UTC values without saying so. The
//! resolution order for a timed value is:
//!
//! 1. An explicit `Z` or numeric offset is authoritative.
//! 2. A reported zone of `UTC`, `Etc/UTC` or `tzone://Microsoft/Utc`
//!    (case-insensitive) means the value is UTC.
//! 3. Otherwise the value is parsed twice, once in the caller's zone (a) and
//!    once as UTC (b). If `|a - b|` equals the caller's offset *right now*,
//!    the value is taken to be UTC (b); otherwise the local reading (a) wins.
//!
//! Step 3 is a heuristic. A local value from the other side of a DST change
//! produces a gap that differs from the current offset and is kept local, so
//! a genuine UTC value written in summer and read in winter is misread. The
//! golden tests below pin the exact before/after pairs.
//!
//! All-day values use the date component only, at local midnight in the
//! caller's zone.

use calsync_core::{AccountId, Attendee, AttendeeStatus, ProviderKind};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::canonical::CanonicalEvent;
use crate::error::{ProviderError, ProviderResult};
use crate::meeting_url::find_meeting_url;
use crate::raw_event::{GoogleEvent, OutlookEvent, RawEvent};

/// Zone names that mean "this value is UTC".
const UTC_SENTINELS: [&str; 3] = ["utc", "etc/utc", "tzone://microsoft/utc"];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
];

/// The caller's zone and clock.
#[derive(Debug, Clone)]
pub struct LocalContext {
    zone: Tz,
    pinned_now: Option<DateTime<Utc>>,
}

impl LocalContext {
    /// Uses the system zone and the live clock.
    pub fn system() -> Self {
        Self::new(detect_local_zone())
    }

    /// Uses the given zone and the live clock.
    pub fn new(zone: Tz) -> Self {
        Self {
            zone,
            pinned_now: None,
        }
    }

    /// Uses the given zone with a frozen clock.
    pub fn fixed(zone: Tz, now: DateTime<Utc>) -> Self {
        Self {
            zone,
            pinned_now: Some(now),
        }
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.pinned_now.unwrap_or_else(Utc::now)
    }

    /// The caller's UTC offset at `now()`, east positive.
    pub fn current_offset(&self) -> Duration {
        let offset = self
            .zone
            .offset_from_utc_datetime(&self.now().naive_utc())
            .fix();
        Duration::seconds(i64::from(offset.local_minus_utc()))
    }
}

impl Default for LocalContext {
    fn default() -> Self {
        Self::system()
    }
}

/// Detects the system IANA zone, falling back to UTC.
pub fn detect_local_zone() -> Tz {
    match iana_time_zone::get_timezone() {
        Ok(name) => name.parse::<Tz>().unwrap_or_else(|_| {
            warn!(zone = %name, "unknown system timezone, using UTC");
            Tz::UTC
        }),
        Err(e) => {
            debug!(error = %e, "could not detect system timezone, using UTC");
            Tz::UTC
        }
    }
}

fn is_utc_sentinel(zone: &str) -> bool {
    let zone = zone.trim().to_ascii_lowercase();
    UTC_SENTINELS.contains(&zone.as_str())
}

fn parse_naive(raw: &str) -> ProviderResult<NaiveDateTime> {
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| ProviderError::invalid_response(format!("unparseable datetime: {raw}")))
}

/// Resolves a timed value to an instant.
pub fn resolve_datetime(
    raw: &str,
    reported_zone: Option<&str>,
    ctx: &LocalContext,
) -> ProviderResult<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(explicit) = DateTime::parse_from_rfc3339(raw) {
        return Ok(explicit.with_timezone(&Utc));
    }
    if let Ok(explicit) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(explicit.with_timezone(&Utc));
    }
    if let Some(stripped) = raw.strip_suffix(['Z', 'z']) {
        return Ok(parse_naive(stripped)?.and_utc());
    }

    let naive = parse_naive(raw)?;
    let as_utc = naive.and_utc();

    if reported_zone.is_some_and(is_utc_sentinel) {
        return Ok(as_utc);
    }

    let Some(as_local) = ctx.zone().from_local_datetime(&naive).earliest() else {
        // skipped by a DST transition, no local reading exists
        return Ok(as_utc);
    };
    let as_local = as_local.with_timezone(&Utc);

    if (as_local - as_utc).abs() == ctx.current_offset().abs() {
        Ok(as_utc)
    } else {
        Ok(as_local)
    }
}

/// Resolves an all-day value to local midnight of its date.
pub fn resolve_all_day(raw: &str, ctx: &LocalContext) -> ProviderResult<DateTime<Utc>> {
    let raw = raw.trim();
    let date_part = raw.get(..10).unwrap_or(raw);
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|e| ProviderError::invalid_response(format!("unparseable date {raw}: {e}")))?;
    local_midnight(date, ctx.zone())
}

fn local_midnight(date: NaiveDate, zone: Tz) -> ProviderResult<DateTime<Utc>> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ProviderError::internal("midnight out of range"))?;
    zone.from_local_datetime(&midnight)
        .earliest()
        // zones whose DST change happens at midnight start the day at 01:00
        .or_else(|| {
            zone.from_local_datetime(&(midnight + Duration::hours(1)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ProviderError::invalid_response(format!("no local midnight on {date}")))
}

/// Converts a raw payload into a canonical event.
pub fn normalize_event(
    raw: RawEvent,
    account_id: &AccountId,
    ctx: &LocalContext,
) -> ProviderResult<CanonicalEvent> {
    let fields = match &raw {
        RawEvent::Google(event) => google_fields(event, ctx),
        RawEvent::Outlook(event) => outlook_fields(event, ctx),
    }
    .map_err(|e| e.with_provider(raw.kind()))?;

    Ok(finish(fields, raw, account_id))
}

/// Normalizes a batch, dropping cancelled and malformed events.
pub fn normalize_events(
    raws: Vec<RawEvent>,
    account_id: &AccountId,
    ctx: &LocalContext,
) -> Vec<CanonicalEvent> {
    raws.into_iter()
        .filter(|raw| !raw.is_cancelled())
        .filter_map(|raw| {
            let id = raw.id().unwrap_or("<missing>").to_string();
            normalize_event(raw, account_id, ctx)
                .map_err(|e| warn!(account = %account_id, event = %id, error = %e, "dropping event"))
                .ok()
        })
        .collect()
}

struct Fields {
    id: String,
    title: String,
    description: Option<String>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    all_day: bool,
    location: Option<String>,
    attendees: Vec<Attendee>,
    online_meeting_url: Option<String>,
}

fn finish(mut fields: Fields, raw: RawEvent, account_id: &AccountId) -> CanonicalEvent {
    let kind: ProviderKind = raw.kind();
    if fields.end < fields.start {
        warn!(
            provider = %kind,
            event = %fields.id,
            start = %fields.start,
            end = %fields.end,
            "event ends before it starts, clamping end to start"
        );
        fields.end = fields.start;
    }

    CanonicalEvent {
        id: fields.id,
        provider_kind: kind,
        account_id: account_id.clone(),
        title: fields.title,
        description: fields.description,
        start_time: fields.start,
        end_time: fields.end,
        all_day: fields.all_day,
        location: fields.location,
        attendees: fields.attendees,
        online_meeting_url: fields.online_meeting_url,
        raw_provider_payload: raw,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn google_fields(event: &GoogleEvent, ctx: &LocalContext) -> ProviderResult<Fields> {
    let id = event
        .id
        .clone()
        .ok_or_else(|| ProviderError::invalid_response("event without id"))?;

    let all_day = event.start.date.is_some() && event.start.date_time.is_none();
    let start = if all_day {
        resolve_all_day(event.start.date.as_deref().unwrap_or_default(), ctx)?
    } else {
        let raw = event.start.date_time.as_deref().ok_or_else(|| {
            ProviderError::invalid_response(format!("event {id} has no start time"))
        })?;
        resolve_datetime(raw, event.start.time_zone.as_deref(), ctx)?
    };
    let end = match (&event.end.date_time, &event.end.date) {
        (Some(dt), _) => resolve_datetime(dt, event.end.time_zone.as_deref(), ctx)?,
        (None, Some(date)) => resolve_all_day(date, ctx)?,
        (None, None) => start,
    };

    let attendees = event
        .attendees
        .iter()
        .filter_map(|a| {
            let email = a.email.clone()?;
            let status = if a.organizer.unwrap_or(false) {
                AttendeeStatus::Organizer
            } else {
                match a.response_status.as_deref() {
                    Some("accepted") => AttendeeStatus::Accepted,
                    Some("declined") => AttendeeStatus::Declined,
                    Some("tentative") => AttendeeStatus::Tentative,
                    Some("needsAction") => AttendeeStatus::NeedsAction,
                    _ => AttendeeStatus::Unknown,
                }
            };
            Some(Attendee {
                email,
                name: a.display_name.clone(),
                status,
            })
        })
        .collect();

    let conference_video = event.conference_data.as_ref().and_then(|cd| {
        cd.entry_points
            .iter()
            .find(|ep| ep.entry_point_type == "video")
            .and_then(|ep| ep.uri.clone())
    });
    let online_meeting_url = event
        .hangout_link
        .clone()
        .or(conference_video)
        .or_else(|| event.location.as_deref().and_then(find_meeting_url))
        .or_else(|| event.description.as_deref().and_then(find_meeting_url));

    Ok(Fields {
        id,
        title: non_empty(event.summary.as_deref()).unwrap_or_else(|| "(No title)".to_string()),
        description: non_empty(event.description.as_deref()),
        start,
        end,
        all_day,
        location: non_empty(event.location.as_deref()),
        attendees,
        online_meeting_url,
    })
}

fn outlook_fields(event: &OutlookEvent, ctx: &LocalContext) -> ProviderResult<Fields> {
    let id = event
        .id
        .clone()
        .ok_or_else(|| ProviderError::invalid_response("event without id"))?;

    if event.start.date_time.is_empty() {
        return Err(ProviderError::invalid_response(format!(
            "event {id} has no start time"
        )));
    }

    let (start, end) = if event.is_all_day {
        let start = resolve_all_day(&event.start.date_time, ctx)?;
        let end = if event.end.date_time.is_empty() {
            start
        } else {
            resolve_all_day(&event.end.date_time, ctx)?
        };
        (start, end)
    } else {
        let start = resolve_datetime(&event.start.date_time, event.start.time_zone.as_deref(), ctx)?;
        let end = if event.end.date_time.is_empty() {
            start
        } else {
            resolve_datetime(&event.end.date_time, event.end.time_zone.as_deref(), ctx)?
        };
        (start, end)
    };

    let body_text = event.body.as_ref().map(|b| b.content.as_str());
    let description = match &event.body {
        Some(body) if body.content_type.eq_ignore_ascii_case("text") => {
            non_empty(Some(body.content.as_str()))
        }
        _ => non_empty(event.body_preview.as_deref()),
    };
    let location = non_empty(
        event
            .location
            .as_ref()
            .and_then(|l| l.display_name.as_deref()),
    );

    let organizer = event
        .organizer
        .as_ref()
        .and_then(|o| o.email_address.address.as_deref())
        .map(str::to_ascii_lowercase);

    let attendees = event
        .attendees
        .iter()
        .filter_map(|a| {
            let email = a.email_address.address.clone()?;
            let response = a.status.as_ref().map(|s| s.response.as_str());
            let status = match response {
                Some("organizer") => AttendeeStatus::Organizer,
                _ if organizer.as_deref() == Some(email.to_ascii_lowercase().as_str()) => {
                    AttendeeStatus::Organizer
                }
                Some("accepted") => AttendeeStatus::Accepted,
                Some("declined") => AttendeeStatus::Declined,
                Some("tentativelyAccepted") => AttendeeStatus::Tentative,
                Some("notResponded") | Some("none") => AttendeeStatus::NeedsAction,
                _ => AttendeeStatus::Unknown,
            };
            Some(Attendee {
                email,
                name: a.email_address.name.clone(),
                status,
            })
        })
        .collect();

    let online_meeting_url = event
        .online_meeting
        .as_ref()
        .and_then(|m| m.join_url.clone())
        .or_else(|| event.online_meeting_url.clone())
        .or_else(|| location.as_deref().and_then(find_meeting_url))
        .or_else(|| body_text.and_then(find_meeting_url));

    Ok(Fields {
        id,
        title: non_empty(event.subject.as_deref()).unwrap_or_else(|| "(No title)".to_string()),
        description,
        start,
        end,
        all_day: event.is_all_day,
        location,
        attendees,
        online_meeting_url,
    })
}
