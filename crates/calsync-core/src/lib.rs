//! Core types: provider kinds, accounts, time windows, event drafts, tracing

pub mod event;
pub mod time;
pub mod tracing;

pub use event::{AccountId, Attendee, AttendeeStatus, EventDraft, Priority, ProviderKind};
pub use time::TimeWindow;
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
