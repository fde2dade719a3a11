//! Query ranges for event fetches.
//!
//! A [`TimeWindow`] is always half-open, `[start, end)`, and always UTC. The
//! aggregator keys cached event lists on both boundaries, so two windows that
//! differ by a second are different cache entries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// # Panics
    ///
    /// If `end` precedes `start`. Use [`TimeWindow::try_new`] for user input.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        assert!(start <= end, "TimeWindow start must be <= end");
        Self { start, end }
    }

    /// `None` for an inverted range. Empty windows are accepted.
    pub fn try_new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        if end < start {
            return None;
        }
        Some(Self { start, end })
    }

    /// The window a background sync covers: `span` ahead of `now`.
    /// A negative span collapses to an empty window at `now`.
    pub fn from_now(now: DateTime<Utc>, span: Duration) -> Self {
        Self {
            start: now,
            end: now + span.max(Duration::zero()),
        }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        (self.start..self.end).contains(&instant)
    }

    /// Whether `other` lies entirely inside this window.
    pub fn covers(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether an event running `[start, end)` should be returned for this
    /// window. Events that only touch a boundary are excluded; zero-length
    /// events (reminders) count when their instant is inside.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match start.cmp(&end) {
            std::cmp::Ordering::Equal => self.contains(start),
            _ => start < self.end && self.start < end,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 5, hour, minute, 0).unwrap()
    }

    fn workday() -> TimeWindow {
        TimeWindow::new(at(9, 0), at(17, 0))
    }

    #[test]
    fn duration_of_workday() {
        assert_eq!(workday().duration(), Duration::hours(8));
        assert!(!workday().is_empty());
    }

    #[test]
    #[should_panic(expected = "start must be <= end")]
    fn new_panics_on_inverted_range() {
        TimeWindow::new(at(17, 0), at(9, 0));
    }

    #[test]
    fn try_new_accepts_empty_rejects_inverted() {
        assert!(TimeWindow::try_new(at(17, 0), at(9, 0)).is_none());
        let empty = TimeWindow::try_new(at(9, 0), at(9, 0)).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn from_now_clamps_negative_span() {
        let window = TimeWindow::from_now(at(9, 0), Duration::hours(-2));
        assert_eq!(window.end, at(9, 0));

        let week = TimeWindow::from_now(at(9, 0), Duration::days(7));
        assert_eq!(week.duration(), Duration::days(7));
    }

    #[test]
    fn end_is_exclusive() {
        let window = workday();
        assert!(window.contains(at(9, 0)));
        assert!(window.contains(at(16, 59)));
        assert!(!window.contains(at(17, 0)));
        assert!(!window.contains(at(8, 59)));
    }

    #[test]
    fn covers_nested_windows_only() {
        let window = workday();
        assert!(window.covers(&window));
        assert!(window.covers(&TimeWindow::new(at(10, 0), at(12, 0))));
        assert!(!window.covers(&TimeWindow::new(at(8, 0), at(12, 0))));
        assert!(!window.covers(&TimeWindow::new(at(16, 0), at(17, 1))));
    }

    #[test]
    fn overlap_rules() {
        let window = workday();

        assert!(window.overlaps(at(10, 0), at(11, 0)));
        assert!(window.overlaps(at(8, 0), at(10, 0)));
        assert!(window.overlaps(at(16, 0), at(18, 0)));
        assert!(window.overlaps(at(8, 0), at(18, 0)));

        assert!(!window.overlaps(at(8, 0), at(9, 0)));
        assert!(!window.overlaps(at(17, 0), at(18, 0)));

        assert!(window.overlaps(at(12, 0), at(12, 0)));
        assert!(!window.overlaps(at(17, 0), at(17, 0)));
    }
}
