//! User activity tracking for sync gating.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ActivityConfig;

/// Tracks the last time the user did something.
///
/// The sync scheduler consults [`allows_sync`](Self::allows_sync) before
/// admitting background jobs.
#[derive(Debug)]
pub struct ActivityMonitor {
    config: ActivityConfig,
    last_activity: Mutex<Instant>,
}

impl ActivityMonitor {
    /// Creates a monitor that considers the user active right now.
    pub fn new(config: ActivityConfig) -> Self {
        Self {
            config,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Records user activity.
    pub fn record_activity(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Returns true once nothing was recorded for longer than the threshold.
    pub fn is_idle(&self) -> bool {
        self.idle_for() > self.config.idle_threshold
    }

    /// Returns true if background work may run in the current state.
    pub fn allows_sync(&self) -> bool {
        if self.is_idle() {
            self.config.enabled_when_idle
        } else {
            self.config.enabled_when_active
        }
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new(ActivityConfig::default())
    }
}
