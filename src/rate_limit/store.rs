//! Rate Limit Config Store
//!
//! Table of per-(credential, endpoint) configs. Reads vastly outnumber
//! writes, so the whole table sits behind one read-write lock; live counters
//! are kept elsewhere and never touch this lock.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::config::{RateLimitConfig, WILDCARD_ENDPOINT};

/// Config table keyed by credential, then endpoint
#[derive(Debug, Default)]
pub struct ConfigStore {
    configs: RwLock<HashMap<String, BTreeMap<String, RateLimitConfig>>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the config for `(config.credential_id, config.endpoint)`
    ///
    /// Returns the config it replaced, if any.
    pub fn upsert(&self, config: RateLimitConfig) -> Option<RateLimitConfig> {
        self.configs
            .write()
            .entry(config.credential_id.clone())
            .or_default()
            .insert(config.endpoint.clone(), config)
    }

    /// Exact config for the pair, without wildcard fallback
    pub fn get(&self, credential_id: &str, endpoint: &str) -> Option<RateLimitConfig> {
        self.configs
            .read()
            .get(credential_id)
            .and_then(|by_endpoint| by_endpoint.get(endpoint))
            .cloned()
    }

    /// Config that governs `endpoint`: exact match first, then the wildcard
    pub fn resolve(&self, credential_id: &str, endpoint: &str) -> Option<RateLimitConfig> {
        let configs = self.configs.read();
        let by_endpoint = configs.get(credential_id)?;
        by_endpoint
            .get(endpoint)
            .or_else(|| by_endpoint.get(WILDCARD_ENDPOINT))
            .cloned()
    }

    /// All configs for a credential, ordered by endpoint
    pub fn list(&self, credential_id: &str) -> Vec<RateLimitConfig> {
        self.configs
            .read()
            .get(credential_id)
            .map(|by_endpoint| by_endpoint.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every config of a credential
    pub fn remove_credential(&self, credential_id: &str) -> usize {
        self.configs
            .write()
            .remove(credential_id)
            .map(|by_endpoint| by_endpoint.len())
            .unwrap_or(0)
    }

    /// Number of configs across all credentials
    pub fn len(&self) -> usize {
        self.configs.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::config::WindowStrategy;
    use chrono::Utc;

    fn config(cred: &str, endpoint: &str, limit: u32) -> RateLimitConfig {
        RateLimitConfig {
            credential_id: cred.to_string(),
            endpoint: endpoint.to_string(),
            limit,
            period_secs: 60,
            strategy: WindowStrategy::Fixed,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_overwrites() {
        let store = ConfigStore::new();
        assert!(store.upsert(config("k1", "/predict", 2)).is_none());
        let previous = store.upsert(config("k1", "/predict", 5)).unwrap();
        assert_eq!(previous.limit, 2);
        assert_eq!(store.get("k1", "/predict").unwrap().limit, 5);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_resolve_prefers_exact_then_wildcard() {
        let store = ConfigStore::new();
        store.upsert(config("k1", WILDCARD_ENDPOINT, 10));
        store.upsert(config("k1", "/predict", 2));

        assert_eq!(store.resolve("k1", "/predict").unwrap().limit, 2);
        assert_eq!(store.resolve("k1", "/train").unwrap().limit, 10);
        assert!(store.resolve("k2", "/predict").is_none());
        assert!(store.get("k1", "/train").is_none());
    }

    #[test]
    fn test_list_is_ordered_by_endpoint() {
        let store = ConfigStore::new();
        store.upsert(config("k1", "/b", 1));
        store.upsert(config("k1", "/a", 1));
        store.upsert(config("k2", "/c", 1));

        let endpoints: Vec<String> = store.list("k1").into_iter().map(|c| c.endpoint).collect();
        assert_eq!(endpoints, vec!["/a", "/b"]);
        assert!(store.list("nobody").is_empty());
    }

    #[test]
    fn test_remove_credential() {
        let store = ConfigStore::new();
        store.upsert(config("k1", "/a", 1));
        store.upsert(config("k1", "/b", 1));
        assert_eq!(store.remove_credential("k1"), 2);
        assert!(store.is_empty());
    }
}
