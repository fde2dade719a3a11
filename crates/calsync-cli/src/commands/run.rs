//! `calsync run`: the sync daemon in the foreground.
//!
//! Starts the aggregator, schedules recurring syncs for every account and
//! serves signals until asked to stop.

use tracing::{info, warn};

use crate::commands::build_aggregator;
use crate::config::CliConfig;
use crate::error::{CliError, CliResult};
use crate::signals::{Signal, SignalHandler};

/// Runs until SIGTERM/SIGINT. SIGHUP syncs every account immediately.
pub async fn run(config: &CliConfig) -> CliResult<()> {
    if config.accounts.is_empty() {
        return Err(CliError::config(format!(
            "no accounts configured; add an [[accounts]] entry to {}",
            CliConfig::default_path().display()
        )));
    }

    let aggregator = build_aggregator(config)?;
    let mut signals = SignalHandler::new();
    signals.spawn_listener()?;

    aggregator.start();
    let jobs = aggregator.schedule_account_syncs();
    info!(
        accounts = aggregator.accounts().len(),
        jobs = jobs.len(),
        "sync daemon running"
    );

    loop {
        match signals.recv().await {
            Signal::Shutdown => break,
            Signal::Resync => {
                aggregator.record_activity();
                for account in aggregator.accounts() {
                    if let Err(e) = aggregator.force_sync_account(&account).await {
                        warn!(account = %account, code = e.code(), error = %e, "forced sync failed");
                    }
                }
            }
        }
    }

    info!("shutting down");
    aggregator.stop().await;
    let stats = aggregator.get_sync_stats();
    info!(
        completed = stats.completed_runs,
        retried = stats.retried_runs,
        failed = stats.failed_jobs,
        "sync daemon stopped"
    );
    Ok(())
}
