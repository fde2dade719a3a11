//! Sync engine: cache, schedulers, batcher and the aggregator.
//!
//! This crate keeps a fresh local view of every configured calendar
//! account:
//! - TTL cache with single-flight loading and pattern invalidation
//! - Background sync scheduler with priorities, retries and activity gating
//! - Credential lease scheduler that renews tokens before they expire
//! - Request batcher that bounds concurrent provider calls
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use calsync_core::{AccountId, ProviderKind};
//! use calsync_engine::{CalendarAggregator, EngineConfig};
//! use calsync_providers::{ErrorProvider, ProviderError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = ErrorProvider::new(
//!         ProviderKind::Google,
//!         AccountId::new("work"),
//!         ProviderError::configuration("not signed in"),
//!     );
//!     let aggregator = CalendarAggregator::builder(EngineConfig::default())
//!         .with_provider(Arc::new(provider))
//!         .build()?;
//!
//!     aggregator.start();
//!     aggregator.schedule_account_syncs();
//!     // Handle requests...
//!     aggregator.stop().await;
//!     Ok(())
//! }
//! ```

mod activity;
mod aggregator;
mod batcher;
mod cache;
mod config;
mod error;
mod lease;
mod retry;
mod scheduler;

pub use activity::ActivityMonitor;
pub use aggregator::{
    AccountConnection, AggregatorBuilder, CachePayload, CalendarAggregator, ConnectionStatus,
};
pub use batcher::{BatchHandle, BatcherStats, RequestBatcher, RequestId, RequestOptions};
pub use cache::{CacheKey, CacheStats, TtlCache};
pub use config::{
    ActivityConfig, BatcherConfig, CacheConfig, EngineConfig, LeaseConfig, SchedulerConfig,
};
pub use error::{EngineError, EngineResult};
pub use lease::{LeaseFailure, LeaseHealth, LeaseScheduler};
pub use retry::RetryPolicy;
pub use scheduler::{
    JobId, JobKind, JobRunner, JobSpec, SchedulerStats, SyncJob, SyncScheduler,
};
