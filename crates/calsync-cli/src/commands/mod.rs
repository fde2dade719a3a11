//! Subcommand implementations and the wiring they share.

pub mod config;
pub mod query;
pub mod run;

use std::sync::Arc;

use calsync_core::ProviderKind;
use calsync_engine::CalendarAggregator;
use calsync_providers::{
    CredentialStore, EventProvider, FileCredentialStore, LocalContext, OAuthRefresher,
};
use tracing::{debug, info};

use crate::config::{AccountSettings, CliConfig};
use crate::error::{CliError, CliResult};

/// Builds the aggregator for every configured account. Nothing is started.
pub fn build_aggregator(config: &CliConfig) -> CliResult<CalendarAggregator> {
    config.validate()?;
    let store: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(config.credentials_path()));
    let local = config.local_context()?;
    debug!(zone = %local.zone(), credentials = %config.credentials_path().display(), "wiring accounts");

    let mut builder =
        CalendarAggregator::builder(config.engine.clone()).with_credentials(Arc::clone(&store));
    for account in &config.accounts {
        builder = builder.with_provider(build_provider(account, &local, Arc::clone(&store))?);
        info!(account = %account.id, provider = %account.provider, "account registered");
    }
    for kind in ProviderKind::ALL {
        if let Some(settings) = config.oauth(kind) {
            let refresher = OAuthRefresher::new(kind, settings.to_client_config(kind)?)?;
            builder = builder.with_refresher(kind, Arc::new(refresher));
        }
    }
    Ok(builder.build()?)
}

fn build_provider(
    account: &AccountSettings,
    local: &LocalContext,
    store: Arc<dyn CredentialStore>,
) -> CliResult<Arc<dyn EventProvider>> {
    match account.provider {
        #[cfg(feature = "google")]
        ProviderKind::Google => {
            use calsync_providers::{GoogleConfig, GoogleProvider};

            let mut config =
                GoogleConfig::new(account.id.as_str()).with_local_context(local.clone());
            if let Some(calendar_id) = &account.calendar_id {
                config = config.with_calendar_id(calendar_id);
            }
            if let Some(base_url) = &account.base_url {
                config = config.with_base_url(base_url);
            }
            Ok(Arc::new(GoogleProvider::new(config, store)?))
        }
        #[cfg(feature = "outlook")]
        ProviderKind::Outlook => {
            use calsync_providers::{OutlookConfig, OutlookProvider};

            let mut config =
                OutlookConfig::new(account.id.as_str()).with_local_context(local.clone());
            if let Some(calendar_id) = &account.calendar_id {
                config = config.with_calendar_id(calendar_id);
            }
            if let Some(base_url) = &account.base_url {
                config = config.with_base_url(base_url);
            }
            Ok(Arc::new(OutlookProvider::new(config, store)?))
        }
        #[allow(unreachable_patterns)]
        other => Err(CliError::config(format!(
            "account `{}`: {} support is not compiled in",
            account.id, other
        ))),
    }
}
