//! Credential leases and where they are kept.
//!
//! A [`CredentialLease`] is the short-lived access token for one provider kind
//! plus what is needed to renew it. Adapters read the current lease from a
//! [`CredentialStore`] on every call, so a refresh performed by the lease
//! scheduler is picked up without rebuilding the adapter.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use calsync_core::ProviderKind;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ProviderError, ProviderResult};

/// Access credential for one provider kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialLease {
    pub kind: ProviderKind,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl CredentialLease {
    pub fn new(
        kind: ProviderKind,
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            access_token: access_token.into(),
            refresh_token: None,
            expires_at,
            scopes: Vec::new(),
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// When the lease should be renewed: `expires_at - margin`.
    pub fn refresh_at(&self, margin: Duration) -> DateTime<Utc> {
        self.expires_at - margin
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns true if the token has the required scopes.
    pub fn has_scopes(&self, required: &[String]) -> bool {
        required.iter().all(|scope| self.scopes.contains(scope))
    }
}

/// Storage for credential leases, keyed by provider kind.
///
/// Encryption at rest is the implementation's concern.
pub trait CredentialStore: Send + Sync {
    fn retrieve(&self, kind: ProviderKind) -> ProviderResult<Option<CredentialLease>>;

    fn store(&self, kind: ProviderKind, lease: CredentialLease) -> ProviderResult<()>;

    fn delete(&self, kind: ProviderKind) -> ProviderResult<()>;
}

/// In-process store, used in tests and for short-lived sessions.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    leases: Mutex<BTreeMap<ProviderKind, CredentialLease>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method that seeds one lease.
    pub fn with_lease(self, lease: CredentialLease) -> Self {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(lease.kind, lease);
        self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn retrieve(&self, kind: ProviderKind) -> ProviderResult<Option<CredentialLease>> {
        Ok(self
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned())
    }

    fn store(&self, kind: ProviderKind, lease: CredentialLease) -> ProviderResult<()> {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, lease);
        Ok(())
    }

    fn delete(&self, kind: ProviderKind) -> ProviderResult<()> {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
        Ok(())
    }
}

/// JSON file holding every lease, rewritten atomically on each change.
///
/// The file is created with mode 0600 on Unix.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    /// In-memory copy of the file contents; `None` until first loaded.
    leases: Mutex<Option<BTreeMap<ProviderKind, CredentialLease>>>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            leases: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> ProviderResult<BTreeMap<ProviderKind, CredentialLease>> {
        if !self.path.exists() {
            debug!(path = ?self.path, "no credential file");
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|e| {
            ProviderError::configuration(format!("failed to read credential file: {}", e))
                .with_source(e)
        })?;

        let leases = serde_json::from_str(&content).map_err(|e| {
            ProviderError::configuration(format!("failed to parse credential file: {}", e))
        })?;

        info!(path = ?self.path, "loaded credentials");
        Ok(leases)
    }

    fn save(&self, leases: &BTreeMap<ProviderKind, CredentialLease>) -> ProviderResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ProviderError::configuration(format!(
                    "failed to create credential directory: {}",
                    e
                ))
            })?;
        }

        // write-then-rename so readers never see a partial file
        let temp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(leases).map_err(|e| {
            ProviderError::internal(format!("failed to serialize credentials: {}", e))
        })?;

        fs::write(&temp_path, &content).map_err(|e| {
            ProviderError::configuration(format!("failed to write credential file: {}", e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&temp_path, perms).map_err(|e| {
                ProviderError::configuration(format!(
                    "failed to restrict credential file permissions: {}",
                    e
                ))
            })?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            ProviderError::configuration(format!("failed to rename credential file: {}", e))
        })?;

        debug!(path = ?self.path, "saved credentials");
        Ok(())
    }

    /// Runs `f` against the loaded map, loading it on first use.
    fn with_leases<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<ProviderKind, CredentialLease>) -> ProviderResult<T>,
    ) -> ProviderResult<T> {
        let mut guard = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        match guard.as_mut() {
            Some(leases) => f(leases),
            None => Err(ProviderError::internal("credential map not loaded")),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn retrieve(&self, kind: ProviderKind) -> ProviderResult<Option<CredentialLease>> {
        self.with_leases(|leases| Ok(leases.get(&kind).cloned()))
    }

    fn store(&self, kind: ProviderKind, lease: CredentialLease) -> ProviderResult<()> {
        self.with_leases(|leases| {
            let previous = leases.insert(kind, lease);
            if let Err(e) = self.save(leases) {
                // keep memory and disk in agreement
                match previous {
                    Some(previous) => leases.insert(kind, previous),
                    None => leases.remove(&kind),
                };
                return Err(e);
            }
            Ok(())
        })
    }

    fn delete(&self, kind: ProviderKind) -> ProviderResult<()> {
        self.with_leases(|leases| {
            if leases.remove(&kind).is_some() {
                info!(provider = %kind, "removed credential lease");
                self.save(leases)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lease(kind: ProviderKind, token: &str) -> CredentialLease {
        CredentialLease::new(
            kind,
            token,
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        )
        .with_refresh_token("refresh")
        .with_scopes(vec!["calendar".to_string()])
    }

    #[test]
    fn refresh_at_subtracts_margin() {
        let lease = lease(ProviderKind::Google, "a");
        assert_eq!(
            lease.refresh_at(Duration::minutes(5)),
            Utc.with_ymd_and_hms(2025, 1, 1, 11, 55, 0).unwrap()
        );
        assert!(lease.is_expired(lease.expires_at));
        assert!(!lease.is_expired(lease.expires_at - Duration::seconds(1)));
        assert!(lease.has_scopes(&["calendar".to_string()]));
        assert!(!lease.has_scopes(&["mail".to_string()]));
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryCredentialStore::new().with_lease(lease(ProviderKind::Google, "a"));
        assert_eq!(
            store.retrieve(ProviderKind::Google).unwrap().unwrap().access_token,
            "a"
        );
        assert!(store.retrieve(ProviderKind::Outlook).unwrap().is_none());

        store.delete(ProviderKind::Google).unwrap();
        assert!(store.retrieve(ProviderKind::Google).unwrap().is_none());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let store = FileCredentialStore::new(&path);
        assert!(store.retrieve(ProviderKind::Google).unwrap().is_none());
        store
            .store(ProviderKind::Google, lease(ProviderKind::Google, "g"))
            .unwrap();
        store
            .store(ProviderKind::Outlook, lease(ProviderKind::Outlook, "o"))
            .unwrap();

        let reopened = FileCredentialStore::new(&path);
        assert_eq!(
            reopened
                .retrieve(ProviderKind::Outlook)
                .unwrap()
                .unwrap()
                .access_token,
            "o"
        );

        reopened.delete(ProviderKind::Google).unwrap();
        let third = FileCredentialStore::new(&path);
        assert!(third.retrieve(ProviderKind::Google).unwrap().is_none());
        assert!(third.retrieve(ProviderKind::Outlook).unwrap().is_some());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = FileCredentialStore::new(&path);
        store
            .store(ProviderKind::Google, lease(ProviderKind::Google, "g"))
            .unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "not json").unwrap();

        let err = FileCredentialStore::new(&path)
            .retrieve(ProviderKind::Google)
            .unwrap_err();
        assert_eq!(err.code(), crate::ProviderErrorCode::Configuration);
    }
}
