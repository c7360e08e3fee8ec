//! Telemetry Broadcaster
//!
//! Turns ledger aggregation deltas into per-user dashboard snapshots and
//! fans them out to live subscriptions.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::queue::SubscriptionQueue;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{AggregationDelta, BucketScope, Granularity, UsageLedger};
use crate::metrics;

/// Telemetry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Pending snapshots per subscription before the oldest is dropped
    pub queue_capacity: usize,

    /// Bucket granularity shown on dashboards
    pub snapshot_granularity: Granularity,

    /// Maximum live subscriptions per user
    pub max_subscriptions_per_user: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            snapshot_granularity: Granularity::Day,
            max_subscriptions_per_user: 8,
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.queue_capacity == 0 {
            return Err(EngineError::invalid("telemetry queue capacity must be positive"));
        }
        if self.max_subscriptions_per_user == 0 {
            return Err(EngineError::invalid(
                "max subscriptions per user must be positive",
            ));
        }
        Ok(())
    }
}

/// Aggregate usage of one user for the current period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub user_id: String,
    pub granularity: Granularity,
    pub period: String,
    /// Endpoint to count
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
    pub generated_at: DateTime<Utc>,
}

type Registry = HashMap<String, HashMap<Uuid, Arc<SubscriptionQueue<DashboardSnapshot>>>>;

struct Shared {
    registry: RwLock<Registry>,
    ledger: Arc<UsageLedger>,
    config: TelemetryConfig,
}

impl Shared {
    fn remove(&self, user_id: &str, id: Uuid) -> bool {
        let removed = {
            let mut registry = self.registry.write();
            let removed = registry
                .get_mut(user_id)
                .and_then(|subs| subs.remove(&id));
            if registry.get(user_id).is_some_and(HashMap::is_empty) {
                registry.remove(user_id);
            }
            removed
        };
        match removed {
            Some(queue) => {
                queue.close();
                metrics::TELEMETRY_SUBSCRIPTIONS_ACTIVE.dec();
                debug!(user_id, subscription = %id, "Removed dashboard subscription");
                true
            }
            None => false,
        }
    }
}

/// Live dashboard subscription
///
/// Dropping the handle unsubscribes, so a connection that goes away without
/// a clean close leaves nothing behind.
pub struct DashboardSubscription {
    id: Uuid,
    user_id: String,
    queue: Arc<SubscriptionQueue<DashboardSnapshot>>,
    shared: Weak<Shared>,
}

impl DashboardSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next snapshot; `None` once the broadcaster shuts the subscription
    pub async fn recv(&self) -> Option<DashboardSnapshot> {
        self.queue.pop().await
    }

    pub fn try_recv(&self) -> Option<DashboardSnapshot> {
        self.queue.try_pop()
    }

    /// Snapshots waiting to be read
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl std::fmt::Debug for DashboardSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardSubscription")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl Drop for DashboardSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(&self.user_id, self.id);
        }
    }
}

/// Telemetry broadcaster
#[derive(Clone)]
pub struct TelemetryBroadcaster {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TelemetryBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBroadcaster")
            .field("subscriptions", &self.subscription_count(None))
            .field("config", &self.shared.config)
            .finish()
    }
}

impl TelemetryBroadcaster {
    pub fn new(config: TelemetryConfig, ledger: Arc<UsageLedger>) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(HashMap::new()),
                ledger,
                config,
            }),
        }
    }

    /// Open a subscription for `user_id`, primed with a current snapshot
    pub fn subscribe(&self, user_id: &str) -> EngineResult<DashboardSubscription> {
        if user_id.trim().is_empty() {
            return Err(EngineError::invalid("user id must not be empty"));
        }

        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriptionQueue::new(self.shared.config.queue_capacity));
        {
            let mut registry = self.shared.registry.write();
            let subs = registry.entry(user_id.to_string()).or_default();
            if subs.len() >= self.shared.config.max_subscriptions_per_user {
                return Err(EngineError::Conflict(format!(
                    "user {} already has {} live subscriptions",
                    user_id,
                    subs.len()
                )));
            }
            subs.insert(id, queue.clone());
        }
        metrics::TELEMETRY_SUBSCRIPTIONS_ACTIVE.inc();
        info!(user_id, subscription = %id, "Opened dashboard subscription");

        queue.push(self.snapshot(user_id, self.shared.ledger.now()));

        Ok(DashboardSubscription {
            id,
            user_id: user_id.to_string(),
            queue,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Remove a subscription explicitly; returns whether it was live
    pub fn unsubscribe(&self, user_id: &str, id: Uuid) -> bool {
        self.shared.remove(user_id, id)
    }

    /// Live subscriptions, for one user or in total
    pub fn subscription_count(&self, user_id: Option<&str>) -> usize {
        let registry = self.shared.registry.read();
        match user_id {
            Some(user_id) => registry.get(user_id).map(HashMap::len).unwrap_or(0),
            None => registry.values().map(HashMap::len).sum(),
        }
    }

    /// Current-period snapshot for `user_id`, read from user-scope buckets
    pub fn snapshot(&self, user_id: &str, at: DateTime<Utc>) -> DashboardSnapshot {
        let granularity = self.shared.config.snapshot_granularity;
        let period = granularity.period_label(at);
        let counts = self.shared.ledger.period_counts(
            &BucketScope::User(user_id.to_string()),
            granularity,
            &period,
        );
        DashboardSnapshot {
            user_id: user_id.to_string(),
            granularity,
            total: counts.values().sum(),
            counts,
            period,
            generated_at: self.shared.ledger.now(),
        }
    }

    /// Push a fresh snapshot to every subscription of `user_id`
    ///
    /// Returns the number of subscriptions reached.
    pub fn push_to_user(&self, user_id: &str, at: DateTime<Utc>) -> usize {
        let queues: Vec<Arc<SubscriptionQueue<DashboardSnapshot>>> = {
            let registry = self.shared.registry.read();
            match registry.get(user_id) {
                Some(subs) => subs.values().cloned().collect(),
                None => return 0,
            }
        };

        let snapshot = self.snapshot(user_id, at);
        for queue in &queues {
            if queue.push(snapshot.clone()) {
                metrics::TELEMETRY_SNAPSHOTS_DROPPED_TOTAL.inc();
            }
            metrics::TELEMETRY_SNAPSHOTS_PUSHED_TOTAL.inc();
        }
        queues.len()
    }

    /// Route one ledger delta to its owner's subscriptions
    pub fn publish(&self, delta: &AggregationDelta) -> usize {
        match &delta.owner_id {
            Some(owner) => self.push_to_user(owner, delta.at),
            None => 0,
        }
    }

    fn resync_all(&self) {
        let users: Vec<String> = self.shared.registry.read().keys().cloned().collect();
        let now = self.shared.ledger.now();
        for user in users {
            self.push_to_user(&user, now);
        }
    }

    /// Start the fan-out task consuming ledger deltas
    ///
    /// The task only holds the broadcaster weakly. Once every broadcaster
    /// handle and the ledger are gone the delta channel closes and the task
    /// ends; aborting the handle stops it sooner.
    pub fn spawn_fanout(&self) -> JoinHandle<()> {
        let mut deltas = self.shared.ledger.subscribe_deltas();
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                let received = deltas.recv().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let broadcaster = TelemetryBroadcaster { shared };
                match received {
                    Ok(delta) => {
                        broadcaster.publish(&delta);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Telemetry fan-out lagged; resyncing all dashboards");
                        broadcaster.resync_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Telemetry fan-out stopped");
        })
    }

    /// Close every subscription
    pub fn close_all(&self) {
        let drained: Vec<_> = self.shared.registry.write().drain().collect();
        for (_, subs) in drained {
            for (_, queue) in subs {
                queue.close();
                metrics::TELEMETRY_SUBSCRIPTIONS_ACTIVE.dec();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credentials::OwnerResolver;
    use crate::ledger::{LedgerConfig, UsageStatus};
    use std::time::Duration;

    struct SingleOwner;

    impl OwnerResolver for SingleOwner {
        fn owner_of(&self, _credential_id: &str) -> Option<String> {
            Some("user-1".to_string())
        }
    }

    fn setup(config: TelemetryConfig) -> (TelemetryBroadcaster, Arc<UsageLedger>) {
        let clock = Arc::new(ManualClock::at_unix(1_714_570_000));
        let ledger = Arc::new(UsageLedger::in_memory(
            LedgerConfig::default(),
            Some(Arc::new(SingleOwner)),
            clock,
        ));
        (TelemetryBroadcaster::new(config, ledger.clone()), ledger)
    }

    #[tokio::test]
    async fn test_subscribe_primes_snapshot() {
        let (broadcaster, _) = setup(TelemetryConfig::default());
        let sub = broadcaster.subscribe("user-1").unwrap();
        let snapshot = sub.try_recv().unwrap();
        assert_eq!(snapshot.user_id, "user-1");
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.period, "2024-05-01");
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let (broadcaster, _) = setup(TelemetryConfig::default());
        let sub = broadcaster.subscribe("user-1").unwrap();
        let other = broadcaster.subscribe("user-1").unwrap();
        assert_eq!(broadcaster.subscription_count(Some("user-1")), 2);

        drop(sub);
        assert_eq!(broadcaster.subscription_count(Some("user-1")), 1);
        assert!(broadcaster.unsubscribe("user-1", other.id()));
        assert_eq!(broadcaster.subscription_count(None), 0);
        assert!(other.recv().await.is_some());
        assert!(other.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fanout_delivers_latest_counts() {
        let (broadcaster, ledger) = setup(TelemetryConfig::default());
        let fanout = broadcaster.spawn_fanout();
        let sub = broadcaster.subscribe("user-1").unwrap();
        sub.try_recv().unwrap();

        ledger
            .record("kg_1", Some("/predict"), "s", UsageStatus::Admitted)
            .await
            .unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.counts.get("/predict"), Some(&1));
        assert_eq!(snapshot.total, 1);
        fanout.abort();
    }

    #[tokio::test]
    async fn test_fanout_ends_once_broadcaster_and_ledger_drop() {
        let (broadcaster, ledger) = setup(TelemetryConfig::default());
        let fanout = broadcaster.spawn_fanout();
        drop(broadcaster);
        drop(ledger);

        tokio::time::timeout(Duration::from_secs(1), fanout)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_slow_consumer_keeps_newest() {
        let (broadcaster, ledger) = setup(TelemetryConfig {
            queue_capacity: 2,
            ..TelemetryConfig::default()
        });
        let sub = broadcaster.subscribe("user-1").unwrap();

        for _ in 0..5 {
            let event = ledger
                .record("kg_1", Some("/predict"), "s", UsageStatus::Admitted)
                .await
                .unwrap();
            broadcaster.publish(&AggregationDelta {
                credential_id: event.credential_id.clone(),
                owner_id: event.owner_id.clone(),
                endpoint: "/predict".to_string(),
                at: event.timestamp,
                buckets: Vec::new(),
            });
        }

        assert_eq!(sub.pending(), 2);
        assert_eq!(sub.try_recv().unwrap().total, 4);
        assert_eq!(sub.try_recv().unwrap().total, 5);
    }

    #[tokio::test]
    async fn test_other_users_not_notified() {
        let (broadcaster, _) = setup(TelemetryConfig::default());
        let sub = broadcaster.subscribe("user-2").unwrap();
        sub.try_recv().unwrap();

        let reached = broadcaster.publish(&AggregationDelta {
            credential_id: "kg_1".to_string(),
            owner_id: Some("user-1".to_string()),
            endpoint: "/p".to_string(),
            at: Utc::now(),
            buckets: Vec::new(),
        });
        assert_eq!(reached, 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let (broadcaster, _) = setup(TelemetryConfig {
            max_subscriptions_per_user: 1,
            ..TelemetryConfig::default()
        });
        let _first = broadcaster.subscribe("user-1").unwrap();
        assert!(matches!(
            broadcaster.subscribe("user-1"),
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            broadcaster.subscribe(""),
            Err(EngineError::InvalidInput(_))
        ));
    }
}
