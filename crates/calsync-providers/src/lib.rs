//! EventProvider trait and implementations.
//!
//! This crate is the boundary between calsync and the external calendar
//! services:
//!
//! - [`EventProvider`] - one account's API client (list, get, create, update,
//!   delete, calendars, connection test)
//! - [`RawEvent`] - provider payloads as a tagged union
//! - [`normalize_event`] - RawEvent to [`CanonicalEvent`], including the
//!   timezone heuristic
//! - [`CredentialLease`] / [`CredentialStore`] - access tokens and where they live
//! - [`LeaseRefresher`] - renewal of leases before they expire
//! - [`ProviderError`] - the error taxonomy shared by every crate above
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │  Google API v3  │    │ Microsoft Graph │
//! └────────┬────────┘    └────────┬────────┘
//!          │                      │
//!          ▼                      ▼
//! ┌─────────────────┐    ┌─────────────────┐
//! │ GoogleProvider  │    │ OutlookProvider │◄── CredentialStore
//! └────────┬────────┘    └────────┬────────┘
//!          │    EventProvider     │
//!          └──────────┬───────────┘
//!                     ▼
//!              ┌─────────────┐
//!              │  RawEvent   │
//!              └──────┬──────┘
//!                     ▼ normalize_event()
//!              ┌──────────────────┐
//!              │  CanonicalEvent  │
//!              └──────────────────┘
//! ```

pub mod canonical;
pub mod credentials;
pub mod error;
#[cfg(feature = "google")]
pub mod google;
pub mod http;
pub mod meeting_url;
pub mod normalize;
#[cfg(feature = "outlook")]
pub mod outlook;
pub mod provider;
pub mod raw_event;
pub mod refresh;

// Re-export main types at crate root
pub use canonical::CanonicalEvent;
pub use credentials::{
    CredentialLease, CredentialStore, FileCredentialStore, MemoryCredentialStore,
};
pub use error::{ProviderError, ProviderErrorCode, ProviderResult};
#[cfg(feature = "google")]
pub use google::{GoogleConfig, GoogleProvider};
pub use normalize::{LocalContext, normalize_event, normalize_events};
#[cfg(feature = "outlook")]
pub use outlook::{OutlookConfig, OutlookProvider};
pub use provider::{AccountProfile, BoxFuture, CalendarInfo, ErrorProvider, EventProvider};
pub use raw_event::{GoogleEvent, OutlookEvent, RawEvent};
pub use refresh::{LeaseRefresher, OAuthClientConfig, OAuthRefresher};
