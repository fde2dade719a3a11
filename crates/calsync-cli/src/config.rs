//! CLI configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/calsync/config.toml` by default:
//!
//! ```toml
//! credentials_path = "/home/me/.local/share/calsync/credentials.json"
//!
//! [[accounts]]
//! id = "work"
//! provider = "google"
//!
//! [[accounts]]
//! id = "corp"
//! provider = "outlook"
//! calendar_id = "AAMkAD..."
//!
//! [google]
//! client_id = "123.apps.googleusercontent.com"
//! client_secret = "env::CALSYNC_GOOGLE_SECRET"
//!
//! [engine.cache]
//! events_ttl = "5m"
//! ```
//!
//! OAuth client values accept the references described in [`crate::secret`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use calsync_core::ProviderKind;
use calsync_engine::EngineConfig;
use calsync_providers::{LocalContext, OAuthClientConfig};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};
use crate::secret;

/// Configuration for the calsync CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Where credential leases are stored.
    pub credentials_path: Option<PathBuf>,

    /// IANA zone used to interpret provider times; the system zone if unset.
    pub timezone: Option<String>,

    /// Google OAuth client.
    pub google: Option<OAuthSettings>,

    /// Microsoft OAuth client.
    pub outlook: Option<OAuthSettings>,

    /// Engine tuning.
    pub engine: EngineConfig,

    /// Calendar accounts to sync.
    pub accounts: Vec<AccountSettings>,
}

/// One calendar account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSettings {
    pub id: String,
    pub provider: ProviderKind,
    /// Calendar to read; the provider's default calendar if unset.
    #[serde(default)]
    pub calendar_id: Option<String>,
    /// API base URL override.
    #[serde(default)]
    pub base_url: Option<String>,
}

/// OAuth client registration for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthSettings {
    /// Client ID (supports `env::` and `pass::` references).
    pub client_id: Option<String>,

    /// Client secret (supports `env::` and `pass::` references).
    pub client_secret: Option<String>,

    /// Token endpoint override.
    pub token_url: Option<String>,
}

impl OAuthSettings {
    /// Resolves secret references into a refresher configuration.
    pub fn to_client_config(&self, kind: ProviderKind) -> CliResult<OAuthClientConfig> {
        let raw_id = self.client_id.as_deref().ok_or_else(|| {
            CliError::config(format!(
                "client_id is missing from the [{}] section of {}",
                kind,
                CliConfig::default_path().display()
            ))
        })?;
        let client_id = secret::resolve(raw_id)
            .map_err(|e| CliError::config(format!("failed to resolve {kind} client_id: {e}")))?;

        let mut config = OAuthClientConfig::for_provider(kind, client_id);
        if let Some(raw_secret) = &self.client_secret {
            let client_secret = secret::resolve(raw_secret).map_err(|e| {
                CliError::config(format!("failed to resolve {kind} client_secret: {e}"))
            })?;
            config = config.with_client_secret(client_secret);
        }
        if let Some(url) = &self.token_url {
            config = config.with_token_url(url);
        }
        Ok(config)
    }
}

impl CliConfig {
    /// Loads configuration from the default path, or defaults if it does not
    /// exist.
    pub fn load() -> CliResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| CliError::config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("calsync")
    }

    /// Returns the default data directory path.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("calsync")
    }

    /// Credential file, defaulting to `credentials.json` in the data directory.
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("credentials.json"))
    }

    /// OAuth settings for `kind`, if configured.
    pub fn oauth(&self, kind: ProviderKind) -> Option<&OAuthSettings> {
        match kind {
            ProviderKind::Google => self.google.as_ref(),
            ProviderKind::Outlook => self.outlook.as_ref(),
        }
    }

    /// Zone and clock used to normalize event times.
    pub fn local_context(&self) -> CliResult<LocalContext> {
        match &self.timezone {
            Some(name) => name
                .parse::<chrono_tz::Tz>()
                .map(LocalContext::new)
                .map_err(|e| CliError::config(format!("invalid timezone `{name}`: {e}"))),
            None => Ok(LocalContext::system()),
        }
    }

    /// Checks account ids, the timezone and every OAuth client reference.
    pub fn validate(&self) -> CliResult<()> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(CliError::config("account id must not be empty"));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(CliError::config(format!(
                    "account `{}` is listed twice",
                    account.id
                )));
            }
        }
        self.local_context()?;
        for kind in ProviderKind::ALL {
            if let Some(settings) = self.oauth(kind) {
                settings.to_client_config(kind)?;
            }
        }
        Ok(())
    }
}
