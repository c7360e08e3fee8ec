//! Credential Store
//!
//! In-memory credential index backed by a durable journal.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::keygen::{self, fingerprint};
use super::model::{Credential, CredentialEvent, CredentialKind, CredentialStatus};
use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::journal::{Journal, MemoryJournal};
use crate::metrics;

/// Credential store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// TTL applied to auth tokens issued without an explicit TTL
    pub default_token_ttl_secs: u64,

    /// Journal file; in-memory when unset
    pub journal_path: Option<String>,

    /// Interval between background expiry sweeps
    pub sweep_interval_secs: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            default_token_ttl_secs: 3600,
            journal_path: None,
            sweep_interval_secs: 300,
        }
    }
}

impl CredentialConfig {
    pub fn default_token_ttl(&self) -> Duration {
        Duration::from_secs(self.default_token_ttl_secs)
    }
}

/// Resolves the owning user of a credential
pub trait OwnerResolver: Send + Sync {
    fn owner_of(&self, credential_id: &str) -> Option<String>;
}

/// Credential store
pub struct CredentialStore {
    records: RwLock<HashMap<String, Credential>>,

    /// Serialises journal-then-apply so journal order matches apply order
    write_gate: tokio::sync::Mutex<()>,

    journal: Arc<dyn Journal<CredentialEvent>>,
    clock: SharedClock,
    config: CredentialConfig,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("records", &self.records.read().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Create an empty store writing to `journal`
    pub fn new(
        config: CredentialConfig,
        journal: Arc<dyn Journal<CredentialEvent>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            write_gate: tokio::sync::Mutex::new(()),
            journal,
            clock,
            config,
        }
    }

    /// Create a store with an in-memory journal
    pub fn in_memory(config: CredentialConfig, clock: SharedClock) -> Self {
        Self::new(config, Arc::new(MemoryJournal::new()), clock)
    }

    /// Rebuild a store by replaying its journal
    pub async fn restore(
        config: CredentialConfig,
        journal: Arc<dyn Journal<CredentialEvent>>,
        clock: SharedClock,
    ) -> EngineResult<Self> {
        let events = journal.replay().await?;
        let store = Self::new(config, journal, clock);
        {
            let mut records = store.records.write();
            for event in &events {
                match event {
                    CredentialEvent::Issued { credential } => {
                        records.insert(credential.id.clone(), credential.clone());
                    }
                    CredentialEvent::Revoked { id, .. } => {
                        if let Some(cred) = records.get_mut(id) {
                            cred.status = CredentialStatus::Revoked;
                        }
                    }
                    CredentialEvent::Reactivated { id, .. } => {
                        if let Some(cred) = records.get_mut(id) {
                            cred.status = CredentialStatus::Active;
                        }
                    }
                    CredentialEvent::Removed { id, .. } => {
                        records.remove(id);
                    }
                }
            }
            info!(
                events = events.len(),
                credentials = records.len(),
                "Restored credential store from journal"
            );
        }
        Ok(store)
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Issue a new credential for `owner_id`
    ///
    /// Auth tokens without an explicit `ttl` get the configured default TTL.
    pub async fn issue(
        &self,
        owner_id: &str,
        kind: CredentialKind,
        ttl: Option<Duration>,
    ) -> EngineResult<Credential> {
        if owner_id.trim().is_empty() {
            return Err(EngineError::invalid("owner id must not be empty"));
        }
        let ttl = match (kind, ttl) {
            (_, Some(ttl)) if ttl.is_zero() => {
                return Err(EngineError::invalid("ttl must be positive"));
            }
            (_, Some(ttl)) => Some(ttl),
            (CredentialKind::AuthToken, None) => Some(self.config.default_token_ttl()),
            (CredentialKind::ApiKey, None) => None,
        };

        let _gate = self.write_gate.lock().await;

        let now = self.clock.now();
        let expires_at = match ttl {
            Some(ttl) => Some(
                now + chrono::Duration::from_std(ttl)
                    .map_err(|_| EngineError::invalid("ttl out of range"))?,
            ),
            None => None,
        };

        let mut id = keygen::generate(kind);
        while self.records.read().contains_key(&id) {
            id = keygen::generate(kind);
        }

        let credential = Credential {
            id,
            owner_id: owner_id.to_string(),
            kind,
            status: CredentialStatus::Active,
            issued_at: now,
            expires_at,
            last_used_at: None,
        };

        self.journal
            .append(&CredentialEvent::Issued {
                credential: credential.clone(),
            })
            .await?;
        self.records
            .write()
            .insert(credential.id.clone(), credential.clone());

        metrics::CREDENTIALS_ISSUED_TOTAL
            .with_label_values(&[kind.as_str()])
            .inc();
        info!(
            owner_id,
            kind = kind.as_str(),
            key = fingerprint(&credential.id),
            "Issued credential"
        );
        Ok(credential)
    }

    /// Validate a credential
    ///
    /// Expiry is checked against the clock on every call, so an expired
    /// record that has not been swept yet still fails with `Expired`.
    pub fn validate(&self, id: &str, check_expiry: bool) -> EngineResult<Credential> {
        let credential = match self.records.read().get(id) {
            Some(cred) => cred.clone(),
            None => {
                metrics::CREDENTIAL_VALIDATIONS_TOTAL
                    .with_label_values(&["not_found"])
                    .inc();
                debug!(key = fingerprint(id), "Credential not found");
                return Err(EngineError::not_found("credential", fingerprint(id)));
            }
        };

        if !credential.is_active() {
            metrics::CREDENTIAL_VALIDATIONS_TOTAL
                .with_label_values(&["revoked"])
                .inc();
            return Err(EngineError::Revoked(fingerprint(id).to_string()));
        }
        if check_expiry && credential.is_expired_at(self.clock.now()) {
            metrics::CREDENTIAL_VALIDATIONS_TOTAL
                .with_label_values(&["expired"])
                .inc();
            return Err(EngineError::Expired(fingerprint(id).to_string()));
        }

        metrics::CREDENTIAL_VALIDATIONS_TOTAL
            .with_label_values(&["valid"])
            .inc();
        Ok(credential)
    }

    /// Validate and require the credential to belong to `owner_id`
    pub fn validate_for_owner(&self, id: &str, owner_id: &str) -> EngineResult<Credential> {
        let credential = self.validate(id, true)?;
        if credential.owner_id != owner_id {
            warn!(
                key = fingerprint(id),
                owner_id, "Credential does not belong to owner"
            );
            return Err(EngineError::Forbidden(format!(
                "credential {} does not belong to {}",
                fingerprint(id),
                owner_id
            )));
        }
        Ok(credential)
    }

    /// Fetch a credential without validating it
    pub fn get(&self, id: &str) -> EngineResult<Credential> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("credential", fingerprint(id)))
    }

    /// Revoke a credential; revoking an already revoked credential is a no-op
    pub async fn revoke(&self, id: &str) -> EngineResult<()> {
        self.set_status(id, CredentialStatus::Revoked).await
    }

    /// Clear revoked status; expiry is left untouched
    pub async fn reactivate(&self, id: &str) -> EngineResult<()> {
        self.set_status(id, CredentialStatus::Active).await
    }

    async fn set_status(&self, id: &str, status: CredentialStatus) -> EngineResult<()> {
        let _gate = self.write_gate.lock().await;

        let current = self
            .records
            .read()
            .get(id)
            .map(|cred| cred.status)
            .ok_or_else(|| EngineError::not_found("credential", fingerprint(id)))?;
        if current == status {
            debug!(key = fingerprint(id), ?status, "Credential already in requested status");
            return Ok(());
        }

        let at = self.clock.now();
        let event = match status {
            CredentialStatus::Revoked => CredentialEvent::Revoked {
                id: id.to_string(),
                at,
            },
            CredentialStatus::Active => CredentialEvent::Reactivated {
                id: id.to_string(),
                at,
            },
        };
        self.journal.append(&event).await?;

        if let Some(cred) = self.records.write().get_mut(id) {
            cred.status = status;
        }

        match status {
            CredentialStatus::Revoked => {
                metrics::CREDENTIALS_REVOKED_TOTAL.inc();
                info!(key = fingerprint(id), "Revoked credential");
            }
            CredentialStatus::Active => info!(key = fingerprint(id), "Reactivated credential"),
        }
        Ok(())
    }

    /// Record a successful use of the credential
    pub fn touch(&self, id: &str) {
        let now = self.clock.now();
        if let Some(cred) = self.records.write().get_mut(id) {
            cred.last_used_at = Some(now);
        }
    }

    /// Delete every record whose expiry has passed
    pub async fn cleanup_expired(&self) -> EngineResult<usize> {
        Ok(self.remove_expired().await?.len())
    }

    /// Delete every record whose expiry has passed, returning the removed ids
    ///
    /// Each record is journaled and removed on its own; validations running
    /// concurrently see either the whole record or nothing.
    pub async fn remove_expired(&self) -> EngineResult<Vec<String>> {
        let now = self.clock.now();
        let candidates: Vec<String> = self
            .records
            .read()
            .values()
            .filter(|cred| cred.is_expired_at(now))
            .map(|cred| cred.id.clone())
            .collect();

        let mut removed = Vec::new();
        for id in candidates {
            let _gate = self.write_gate.lock().await;
            let still_present = self.records.read().contains_key(&id);
            if !still_present {
                continue;
            }
            self.journal
                .append(&CredentialEvent::Removed {
                    id: id.clone(),
                    at: now,
                })
                .await?;
            self.records.write().remove(&id);
            removed.push(id);
        }

        if !removed.is_empty() {
            metrics::CREDENTIALS_SWEPT_TOTAL.inc_by(removed.len() as u64);
        }
        info!(removed = removed.len(), "Cleaned up expired credentials");
        Ok(removed)
    }

    /// All credentials owned by `owner_id`, oldest first
    pub fn list_by_owner(&self, owner_id: &str) -> Vec<Credential> {
        let mut owned: Vec<Credential> = self
            .records
            .read()
            .values()
            .filter(|cred| cred.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.id.cmp(&b.id)));
        owned
    }

    /// Count credentials, optionally restricted to an owner and/or active ones
    pub fn count(&self, owner_id: Option<&str>, active_only: bool) -> usize {
        self.records
            .read()
            .values()
            .filter(|cred| owner_id.is_none_or(|owner| cred.owner_id == owner))
            .filter(|cred| !active_only || cred.is_active())
            .count()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl OwnerResolver for CredentialStore {
    fn owner_of(&self, credential_id: &str) -> Option<String> {
        self.records
            .read()
            .get(credential_id)
            .map(|cred| cred.owner_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::journal::FileJournal;
    use chrono::Duration as ChronoDuration;

    fn store_with_clock() -> (CredentialStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let store = CredentialStore::in_memory(CredentialConfig::default(), clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn test_issue_then_validate() {
        let (store, _) = store_with_clock();
        let cred = store
            .issue("user-1", CredentialKind::ApiKey, None)
            .await
            .unwrap();

        assert!(cred.expires_at.is_none());
        let validated = store.validate(&cred.id, true).unwrap();
        assert_eq!(validated.owner_id, "user-1");
        assert_eq!(validated.status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn test_tokens_always_expire() {
        let (store, clock) = store_with_clock();
        let token = store
            .issue("user-1", CredentialKind::AuthToken, None)
            .await
            .unwrap();
        assert_eq!(
            token.expires_at,
            Some(clock.now() + ChronoDuration::seconds(3600))
        );
    }

    #[tokio::test]
    async fn test_issue_rejects_bad_input() {
        let (store, _) = store_with_clock();
        assert!(matches!(
            store.issue("  ", CredentialKind::ApiKey, None).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            store
                .issue("u", CredentialKind::ApiKey, Some(Duration::ZERO))
                .await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_revoke_then_validate() {
        let (store, _) = store_with_clock();
        let cred = store
            .issue("user-1", CredentialKind::ApiKey, None)
            .await
            .unwrap();

        store.revoke(&cred.id).await.unwrap();
        assert!(matches!(
            store.validate(&cred.id, true),
            Err(EngineError::Revoked(_))
        ));
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let (store, _) = store_with_clock();
        let cred = store
            .issue("user-1", CredentialKind::ApiKey, None)
            .await
            .unwrap();

        store.revoke(&cred.id).await.unwrap();
        store.revoke(&cred.id).await.unwrap();
        assert_eq!(store.get(&cred.id).unwrap().status, CredentialStatus::Revoked);
        assert_eq!(store.count(Some("user-1"), false), 1);
    }

    #[tokio::test]
    async fn test_unknown_credential() {
        let (store, _) = store_with_clock();
        assert!(matches!(
            store.validate("kg_missing", true),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            store.revoke("kg_missing").await,
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            store.reactivate("kg_missing").await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reactivate_revoked_unexpired() {
        let (store, _) = store_with_clock();
        let cred = store
            .issue("user-1", CredentialKind::AuthToken, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        store.revoke(&cred.id).await.unwrap();
        store.reactivate(&cred.id).await.unwrap();
        assert!(store.validate(&cred.id, true).is_ok());
    }

    #[tokio::test]
    async fn test_reactivate_does_not_reset_expiry() {
        let (store, clock) = store_with_clock();
        let cred = store
            .issue("user-1", CredentialKind::AuthToken, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        store.revoke(&cred.id).await.unwrap();
        clock.advance(ChronoDuration::seconds(61));
        store.reactivate(&cred.id).await.unwrap();

        assert!(matches!(
            store.validate(&cred.id, true),
            Err(EngineError::Expired(_))
        ));
        assert!(store.validate(&cred.id, false).is_ok());
        assert_eq!(store.get(&cred.id).unwrap().expires_at, cred.expires_at);
    }

    #[tokio::test]
    async fn test_expired_before_sweep() {
        let (store, clock) = store_with_clock();
        let cred = store
            .issue("user-1", CredentialKind::AuthToken, Some(Duration::from_secs(10)))
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(11));
        assert!(matches!(
            store.validate(&cred.id, true),
            Err(EngineError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_for_owner() {
        let (store, _) = store_with_clock();
        let cred = store
            .issue("user-1", CredentialKind::ApiKey, None)
            .await
            .unwrap();

        assert!(store.validate_for_owner(&cred.id, "user-1").is_ok());
        assert!(matches!(
            store.validate_for_owner(&cred.id, "user-2"),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (store, clock) = store_with_clock();
        let short = store
            .issue("user-1", CredentialKind::AuthToken, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let long = store
            .issue("user-1", CredentialKind::AuthToken, Some(Duration::from_secs(500)))
            .await
            .unwrap();
        let forever = store
            .issue("user-1", CredentialKind::ApiKey, None)
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(6));
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);

        assert!(store.get(&short.id).is_err());
        assert!(store.get(&long.id).is_ok());
        assert!(store.get(&forever.id).is_ok());
        assert_eq!(store.cleanup_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let (store, clock) = store_with_clock();
        let first = store
            .issue("user-1", CredentialKind::ApiKey, None)
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(1));
        let second = store
            .issue("user-1", CredentialKind::ApiKey, None)
            .await
            .unwrap();
        store
            .issue("user-2", CredentialKind::ApiKey, None)
            .await
            .unwrap();
        store.revoke(&second.id).await.unwrap();

        let owned = store.list_by_owner("user-1");
        assert_eq!(owned.len(), 2);
        assert_eq!(owned[0].id, first.id);

        assert_eq!(store.count(None, false), 3);
        assert_eq!(store.count(None, true), 2);
        assert_eq!(store.count(Some("user-1"), true), 1);
        assert_eq!(store.count(Some("nobody"), false), 0);
    }

    #[tokio::test]
    async fn test_touch_updates_last_used() {
        let (store, clock) = store_with_clock();
        let cred = store
            .issue("user-1", CredentialKind::ApiKey, None)
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(30));
        store.touch(&cred.id);
        assert_eq!(store.get(&cred.id).unwrap().last_used_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_journal_failure_leaves_store_unchanged() {
        let clock = Arc::new(ManualClock::at_unix(0));
        let journal = Arc::new(MemoryJournal::<CredentialEvent>::new());
        let store = CredentialStore::new(CredentialConfig::default(), journal.clone(), clock);

        let cred = store
            .issue("user-1", CredentialKind::ApiKey, None)
            .await
            .unwrap();
        journal.fail_next(1);
        assert!(matches!(
            store.revoke(&cred.id).await,
            Err(EngineError::Unavailable(_))
        ));
        assert!(store.validate(&cred.id, true).is_ok());
    }

    #[tokio::test]
    async fn test_restore_from_file_journal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("credentials.jsonl");
        let clock = Arc::new(ManualClock::at_unix(1_000));

        let (kept, revoked, expired) = {
            let journal = Arc::new(FileJournal::<CredentialEvent>::open(&path).await.unwrap());
            let store = CredentialStore::new(CredentialConfig::default(), journal, clock.clone());
            let kept = store.issue("u", CredentialKind::ApiKey, None).await.unwrap();
            let revoked = store.issue("u", CredentialKind::ApiKey, None).await.unwrap();
            let expired = store
                .issue("u", CredentialKind::AuthToken, Some(Duration::from_secs(1)))
                .await
                .unwrap();
            store.revoke(&revoked.id).await.unwrap();
            clock.advance(ChronoDuration::seconds(5));
            store.cleanup_expired().await.unwrap();
            (kept, revoked, expired)
        };

        let journal = Arc::new(FileJournal::<CredentialEvent>::open(&path).await.unwrap());
        let restored = CredentialStore::restore(CredentialConfig::default(), journal, clock)
            .await
            .unwrap();

        assert!(restored.validate(&kept.id, true).is_ok());
        assert!(matches!(
            restored.validate(&revoked.id, true),
            Err(EngineError::Revoked(_))
        ));
        assert!(restored.get(&expired.id).is_err());
        assert_eq!(restored.count(None, false), 2);
    }

    #[tokio::test]
    async fn test_owner_resolver() {
        let (store, _) = store_with_clock();
        let cred = store
            .issue("user-9", CredentialKind::ApiKey, None)
            .await
            .unwrap();
        assert_eq!(store.owner_of(&cred.id), Some("user-9".to_string()));
        assert_eq!(store.owner_of("kg_nope"), None);
    }
}
