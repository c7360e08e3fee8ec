//! Rate Limiter
//!
//! Admit/deny decisions for (credential, endpoint) pairs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::config::{
    validate_limit, DefaultPolicy, LimiterSettings, RateLimitConfig, WindowStrategy,
};
use super::store::ConfigStore;
use super::window::{WindowCounter, WindowDecision, WindowUsage};
use crate::clock::SharedClock;
use crate::credentials::keygen::fingerprint;
use crate::credentials::CredentialStore;
use crate::error::{EngineError, EngineResult};
use crate::metrics;

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Admit {
        /// Requests left in the window; `None` when the pair is not counted
        remaining: Option<u32>,
        reset_at: Option<DateTime<Utc>>,
    },
    Deny {
        #[serde(with = "duration_millis")]
        retry_after: Duration,
        reset_at: Option<DateTime<Utc>>,
        reason: String,
    },
}

impl Admission {
    /// Admit without counting
    pub fn unlimited() -> Self {
        Admission::Admit {
            remaining: None,
            reset_at: None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admit { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Admit { .. } => None,
            Admission::Deny { retry_after, .. } => Some(*retry_after),
        }
    }

    /// Convert a denial into `EngineError::RateLimited`
    pub fn into_result(self) -> EngineResult<Self> {
        match self {
            Admission::Deny { retry_after, .. } => Err(EngineError::RateLimited { retry_after }),
            admit => Ok(admit),
        }
    }

    fn from_window(decision: WindowDecision) -> Self {
        match decision {
            WindowDecision::Admit {
                remaining,
                reset_at,
            } => Admission::Admit {
                remaining: Some(remaining),
                reset_at: Some(reset_at),
            },
            WindowDecision::Deny {
                retry_after,
                reset_at,
            } => Admission::Deny {
                retry_after,
                reset_at: Some(reset_at),
                reason: "rate limit exceeded".to_string(),
            },
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

type CounterKey = (String, String);
type CounterSlot = Arc<Mutex<WindowCounter>>;

/// Effective limit for one check
struct Plan {
    counter_endpoint: String,
    limit: u32,
    period: Duration,
    strategy: WindowStrategy,
}

/// Per-(credential, endpoint) rate limiter
///
/// Counters live in a sharded arena; each counter has its own lock, so
/// concurrent checks on the same key serialise while different keys proceed
/// independently.
pub struct RateLimiter {
    settings: LimiterSettings,
    configs: ConfigStore,
    counters: DashMap<CounterKey, CounterSlot>,
    credentials: Arc<CredentialStore>,
    clock: SharedClock,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .field("configs", &self.configs.len())
            .field("counters", &self.counters.len())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(
        settings: LimiterSettings,
        credentials: Arc<CredentialStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            settings,
            configs: ConfigStore::new(),
            counters: DashMap::new(),
            credentials,
            clock,
        }
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Check the credential and admit or deny one request on `endpoint`
    ///
    /// Fails with the credential's validation error (`NotFound`, `Revoked`,
    /// `Expired`) before any counter is touched. A denial is a normal
    /// `Ok(Admission::Deny { .. })`, not an error.
    pub fn check_and_admit(&self, credential_id: &str, endpoint: &str) -> EngineResult<Admission> {
        let _timer = metrics::ADMISSION_CHECK_DURATION_SECONDS.start_timer();

        self.credentials.validate(credential_id, true)?;

        let admission = if self.settings.enabled {
            match self.plan(credential_id, endpoint) {
                Ok(plan) => self.admit_counted(credential_id, plan),
                Err(admission) => admission,
            }
        } else {
            Admission::unlimited()
        };

        let label = if admission.is_admitted() { "admit" } else { "deny" };
        metrics::ADMISSION_DECISIONS_TOTAL
            .with_label_values(&[label])
            .inc();
        debug!(
            key = fingerprint(credential_id),
            endpoint,
            decision = label,
            "Admission decision"
        );
        Ok(admission)
    }

    /// Work out which counter and limit apply, or the uncounted outcome
    fn plan(&self, credential_id: &str, endpoint: &str) -> Result<Plan, Admission> {
        if let Some(config) = self.configs.resolve(credential_id, endpoint) {
            return Ok(Plan {
                limit: config.limit,
                period: config.period(),
                strategy: config.strategy,
                counter_endpoint: config.endpoint,
            });
        }

        match &self.settings.default_policy {
            DefaultPolicy::AllowAll => Err(Admission::unlimited()),
            DefaultPolicy::DenyAll => Err(Admission::Deny {
                retry_after: Duration::ZERO,
                reset_at: None,
                reason: "no rate limit configured".to_string(),
            }),
            DefaultPolicy::Limited { limit, period_secs } => Ok(Plan {
                counter_endpoint: endpoint.to_string(),
                limit: *limit,
                period: Duration::from_secs(*period_secs),
                strategy: WindowStrategy::Fixed,
            }),
        }
    }

    fn admit_counted(&self, credential_id: &str, plan: Plan) -> Admission {
        let key = (credential_id.to_string(), plan.counter_endpoint);
        loop {
            let slot = self
                .counters
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(WindowCounter::new())))
                .clone();

            let mut counter = slot.lock();
            if counter.retired {
                // Lost a race with the pruner; the next entry() call creates a fresh slot
                continue;
            }
            let now = self.clock.now();
            let decision = counter.try_admit(now, plan.limit, plan.period, plan.strategy);
            return Admission::from_window(decision);
        }
    }

    /// All configs of a credential, ordered by endpoint
    pub fn get_config(&self, credential_id: &str) -> Vec<RateLimitConfig> {
        self.configs.list(credential_id)
    }

    /// Set the fixed-window limit for a pair, replacing any existing config
    pub fn upsert_config(
        &self,
        credential_id: &str,
        endpoint: &str,
        limit: u32,
        period_secs: u64,
    ) -> EngineResult<RateLimitConfig> {
        self.upsert_config_with_strategy(
            credential_id,
            endpoint,
            limit,
            period_secs,
            WindowStrategy::Fixed,
        )
    }

    /// Set the limit for a pair with an explicit window strategy
    ///
    /// The credential must exist. Live counters are left as they are: a new
    /// limit applies to the counter's next check, a new period to the next
    /// window computed with it.
    pub fn upsert_config_with_strategy(
        &self,
        credential_id: &str,
        endpoint: &str,
        limit: u32,
        period_secs: u64,
        strategy: WindowStrategy,
    ) -> EngineResult<RateLimitConfig> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(EngineError::invalid("endpoint must not be empty"));
        }
        validate_limit(limit, period_secs)?;
        self.credentials.get(credential_id)?;

        let config = RateLimitConfig {
            credential_id: credential_id.to_string(),
            endpoint: endpoint.to_string(),
            limit,
            period_secs,
            strategy,
            updated_at: self.clock.now(),
        };
        let replaced = self.configs.upsert(config.clone());

        info!(
            key = fingerprint(credential_id),
            endpoint,
            limit,
            period_secs,
            ?strategy,
            replaced = replaced.is_some(),
            "Upserted rate limit config"
        );
        Ok(config)
    }

    /// Current-window usage per configured endpoint
    ///
    /// With `endpoint` set, reports only that endpoint, resolved through the
    /// wildcard config if it has none of its own. A counter whose window has
    /// passed reports zero.
    pub fn usage_summary(
        &self,
        credential_id: &str,
        endpoint: Option<&str>,
    ) -> BTreeMap<String, WindowUsage> {
        let configs: Vec<(String, RateLimitConfig)> = match endpoint {
            Some(endpoint) => self
                .configs
                .resolve(credential_id, endpoint)
                .map(|config| vec![(endpoint.to_string(), config)])
                .unwrap_or_default(),
            None => self
                .configs
                .list(credential_id)
                .into_iter()
                .map(|config| (config.endpoint.clone(), config))
                .collect(),
        };

        let now = self.clock.now();
        configs
            .into_iter()
            .map(|(name, config)| {
                let key = (credential_id.to_string(), config.endpoint.clone());
                let usage = match self.counters.get(&key) {
                    Some(slot) => slot.lock().usage_at(now, config.limit, config.period()),
                    None => WindowCounter::new().usage_at(now, config.limit, config.period()),
                };
                (name, usage)
            })
            .collect()
    }

    /// Drop counters whose windows can no longer affect a decision
    pub fn prune_idle_counters(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, slot| {
            let mut counter = slot.lock();
            if counter.is_idle(now) {
                counter.retired = true;
                false
            } else {
                true
            }
        });
        let pruned = before.saturating_sub(self.counters.len());
        debug!(pruned, remaining = self.counters.len(), "Pruned idle counters");
        pruned
    }

    /// Drop the configs and counters of credentials that no longer exist
    ///
    /// Returns the number of configs removed.
    pub fn forget_credentials(&self, credential_ids: &[String]) -> usize {
        if credential_ids.is_empty() {
            return 0;
        }
        let configs: usize = credential_ids
            .iter()
            .map(|id| self.configs.remove_credential(id))
            .sum();

        let gone: HashSet<&str> = credential_ids.iter().map(String::as_str).collect();
        let before = self.counters.len();
        self.counters.retain(|(credential_id, _), slot| {
            if gone.contains(credential_id.as_str()) {
                slot.lock().retired = true;
                false
            } else {
                true
            }
        });
        debug!(
            credentials = credential_ids.len(),
            configs,
            counters = before.saturating_sub(self.counters.len()),
            "Forgot rate limits of removed credentials"
        );
        configs
    }

    /// Number of live counters
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}
