//! One-shot commands: `events`, `check`, `stats`.
//!
//! Each starts the engine, does its work through the aggregator, prints
//! JSON to stdout and stops the engine again.

use std::io::Write;

use calsync_core::AccountId;
use calsync_engine::{CalendarAggregator, ConnectionStatus};
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::commands::build_aggregator;
use crate::config::CliConfig;
use crate::error::{CliError, CliResult};

fn print_json(value: &impl Serialize) -> CliResult<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn started(config: &CliConfig) -> CliResult<CalendarAggregator> {
    let aggregator = build_aggregator(config)?;
    aggregator.start();
    Ok(aggregator)
}

/// Prints the normalized events of the next `days` days.
pub async fn events(config: &CliConfig, days: u32, account: Option<String>) -> CliResult<()> {
    let start = Utc::now();
    let end = start + Duration::days(i64::from(days.max(1)));

    let aggregator = started(config)?;
    let result = match &account {
        Some(id) => {
            aggregator
                .get_events(&AccountId::new(id.as_str()), start, end)
                .await
        }
        None => aggregator.get_all_events(start, end).await,
    };
    aggregator.stop().await;

    print_json(&result?)
}

/// Verifies every account. Fails if any account is disconnected.
pub async fn check(config: &CliConfig) -> CliResult<()> {
    let aggregator = started(config)?;
    let accounts = aggregator.test_all_connections().await;
    let leases = aggregator.get_lease_health();
    aggregator.stop().await;

    print_json(&json!({ "accounts": accounts, "leases": leases }))?;

    let disconnected: Vec<String> = accounts
        .iter()
        .filter(|account| matches!(account.status, ConnectionStatus::Disconnected { .. }))
        .map(|account| account.id.to_string())
        .collect();
    if disconnected.is_empty() {
        Ok(())
    } else {
        Err(CliError::config(format!(
            "re-authorization required for: {}",
            disconnected.join(", ")
        )))
    }
}

/// Syncs every account once and prints the engine statistics.
pub async fn stats(config: &CliConfig) -> CliResult<()> {
    let aggregator = started(config)?;
    for account in aggregator.accounts() {
        if let Err(e) = aggregator.force_sync_account(&account).await {
            warn!(account = %account, code = e.code(), error = %e, "sync failed");
        }
    }
    let report = json!({
        "cache": aggregator.get_cache_stats(),
        "sync": aggregator.get_sync_stats(),
        "batcher": aggregator.get_batcher_stats(),
        "leases": aggregator.get_lease_health(),
        "accounts": aggregator.get_connected_accounts(),
    });
    aggregator.stop().await;

    print_json(&report)
}
