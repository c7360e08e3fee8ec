//! Usage Ledger
//!
//! Append-only event log with incrementally maintained stats buckets.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::buckets::{BucketIndex, BucketScope, Granularity, StatsBucket};
use super::event::{GroupBy, UsageEvent, UsageFilter, UsageStatus, UsageSummary, NO_ENDPOINT};
use crate::clock::SharedClock;
use crate::credentials::keygen::fingerprint;
use crate::credentials::OwnerResolver;
use crate::error::{EngineError, EngineResult};
use crate::journal::{Journal, MemoryJournal};
use crate::metrics;
use crate::retry::{retry_unavailable, RetryConfig};

/// Events read per lock acquisition when scanning
pub const PAGE_SIZE: usize = 256;

/// What the engine does when a usage event cannot be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountingFailurePolicy {
    /// Fail the original request with `Unavailable`
    #[default]
    FailRequest,
    /// Return the admission decision without accounting
    Proceed,
}

/// Usage ledger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Journal file; in-memory when unset
    pub journal_path: Option<String>,

    /// Events older than this are deleted by the retention sweep; kept forever when unset
    pub retention_secs: Option<u64>,

    /// Interval between retention sweeps
    pub sweep_interval_secs: u64,

    /// Bucket granularities maintained on every record
    pub granularities: Vec<Granularity>,

    /// Capacity of the aggregation delta channel
    pub delta_channel_capacity: usize,

    /// What to do when accounting fails after retries
    pub on_accounting_failure: AccountingFailurePolicy,

    /// Backoff for journal writes
    pub retry: RetryConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            retention_secs: Some(30 * 24 * 3600),
            sweep_interval_secs: 3600,
            granularities: Granularity::ALL.to_vec(),
            delta_channel_capacity: 1024,
            on_accounting_failure: AccountingFailurePolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.granularities.is_empty() {
            return Err(EngineError::invalid("at least one bucket granularity is required"));
        }
        if self.delta_channel_capacity == 0 {
            return Err(EngineError::invalid("delta channel capacity must be positive"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(EngineError::invalid("ledger sweep interval must be positive"));
        }
        if self.retention_secs == Some(0) {
            return Err(EngineError::invalid("retention must be positive"));
        }
        Ok(())
    }
}

/// Journal record for a ledger mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LedgerRecord {
    Recorded {
        event: UsageEvent,
    },
    Deleted {
        id: Uuid,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Published after every successful record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationDelta {
    pub credential_id: String,
    pub owner_id: Option<String>,
    pub endpoint: String,
    pub at: DateTime<Utc>,
    /// Buckets as they stand after the increment
    pub buckets: Vec<StatsBucket>,
}

type EventKey = (DateTime<Utc>, u64);

/// Usage ledger
pub struct UsageLedger {
    events: RwLock<BTreeMap<EventKey, UsageEvent>>,
    buckets: BucketIndex,
    next_seq: AtomicU64,

    /// Serialises journal-then-apply
    write_gate: tokio::sync::Mutex<()>,

    journal: Arc<dyn Journal<LedgerRecord>>,
    owners: Option<Arc<dyn OwnerResolver>>,
    deltas: broadcast::Sender<AggregationDelta>,
    clock: SharedClock,
    config: LedgerConfig,
}

impl std::fmt::Debug for UsageLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLedger")
            .field("events", &self.events.read().len())
            .field("buckets", &self.buckets.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl UsageLedger {
    pub fn new(
        config: LedgerConfig,
        journal: Arc<dyn Journal<LedgerRecord>>,
        owners: Option<Arc<dyn OwnerResolver>>,
        clock: SharedClock,
    ) -> Self {
        let (deltas, _) = broadcast::channel(config.delta_channel_capacity.max(1));
        Self {
            events: RwLock::new(BTreeMap::new()),
            buckets: BucketIndex::new(&config.granularities),
            next_seq: AtomicU64::new(1),
            write_gate: tokio::sync::Mutex::new(()),
            journal,
            owners,
            deltas,
            clock,
            config,
        }
    }

    /// Ledger with an in-memory journal
    pub fn in_memory(
        config: LedgerConfig,
        owners: Option<Arc<dyn OwnerResolver>>,
        clock: SharedClock,
    ) -> Self {
        Self::new(config, Arc::new(MemoryJournal::new()), owners, clock)
    }

    /// Rebuild events and buckets by replaying the journal
    pub async fn restore(
        config: LedgerConfig,
        journal: Arc<dyn Journal<LedgerRecord>>,
        owners: Option<Arc<dyn OwnerResolver>>,
        clock: SharedClock,
    ) -> EngineResult<Self> {
        let records = journal.replay().await?;
        let ledger = Self::new(config, journal, owners, clock);
        let mut max_seq = 0;
        {
            let mut events = ledger.events.write();
            for record in records {
                match record {
                    LedgerRecord::Recorded { event } => {
                        max_seq = max_seq.max(event.seq);
                        ledger.buckets.increment(
                            &Self::scopes_of(&event),
                            event.endpoint_key(),
                            event.timestamp,
                        );
                        events.insert(event.order_key(), event);
                    }
                    LedgerRecord::Deleted { seq, timestamp, .. } => {
                        if let Some(event) = events.remove(&(timestamp, seq)) {
                            ledger.buckets.decrement(
                                &Self::scopes_of(&event),
                                event.endpoint_key(),
                                event.timestamp,
                            );
                        }
                    }
                }
            }
            info!(
                events = events.len(),
                buckets = ledger.buckets.len(),
                "Restored usage ledger from journal"
            );
        }
        ledger.next_seq.store(max_seq + 1, Ordering::SeqCst);
        Ok(ledger)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Receive a delta for every record from now on
    pub fn subscribe_deltas(&self) -> broadcast::Receiver<AggregationDelta> {
        self.deltas.subscribe()
    }

    fn scopes_of(event: &UsageEvent) -> Vec<BucketScope> {
        let mut scopes = vec![BucketScope::Credential(event.credential_id.clone())];
        if let Some(owner) = &event.owner_id {
            scopes.push(BucketScope::User(owner.clone()));
        }
        scopes
    }

    /// Append one usage event
    ///
    /// Journal failures are retried with backoff; if the budget runs out
    /// the call fails with `Unavailable` and nothing is recorded.
    pub async fn record(
        &self,
        credential_id: &str,
        endpoint: Option<&str>,
        identifier: &str,
        status: UsageStatus,
    ) -> EngineResult<UsageEvent> {
        if credential_id.is_empty() {
            return Err(EngineError::invalid("credential id must not be empty"));
        }
        if let UsageStatus::Custom(code) = &status {
            if code.trim().is_empty() {
                return Err(EngineError::invalid("status must not be empty"));
            }
        }

        let owner_id = self
            .owners
            .as_ref()
            .and_then(|owners| owners.owner_of(credential_id));

        let gate = self.write_gate.lock().await;

        let event = UsageEvent {
            id: Uuid::new_v4(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            credential_id: credential_id.to_string(),
            owner_id,
            endpoint: endpoint.map(str::to_string),
            identifier: identifier.to_string(),
            status,
            timestamp: self.clock.now(),
        };

        let record = LedgerRecord::Recorded {
            event: event.clone(),
        };
        retry_unavailable(
            &self.config.retry,
            "usage journal append",
            || self.journal.append(&record),
            |_| metrics::LEDGER_WRITE_RETRIES_TOTAL.inc(),
        )
        .await?;

        self.events.write().insert(event.order_key(), event.clone());
        let buckets = self.buckets.increment(
            &Self::scopes_of(&event),
            event.endpoint_key(),
            event.timestamp,
        );
        drop(gate);

        metrics::LEDGER_EVENTS_TOTAL
            .with_label_values(&[event.status.as_str()])
            .inc();
        debug!(
            key = fingerprint(credential_id),
            endpoint = event.endpoint_key(),
            status = %event.status,
            seq = event.seq,
            "Recorded usage event"
        );

        // No receivers is fine
        let _ = self.deltas.send(AggregationDelta {
            credential_id: event.credential_id.clone(),
            owner_id: event.owner_id.clone(),
            endpoint: event.endpoint_key().to_string(),
            at: event.timestamp,
            buckets,
        });

        Ok(event)
    }

    /// Lazily iterate events matching `filter` in timestamp order
    ///
    /// Events recorded after the call are not yielded, so re-issuing the same
    /// filter gives the same result set as long as nothing is deleted.
    pub fn query(&self, filter: UsageFilter) -> EventCursor<'_> {
        EventCursor {
            ledger: self,
            filter,
            high_water: self.next_seq.load(Ordering::SeqCst),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Collect every matching event, yielding to the runtime between pages
    pub async fn query_all(&self, filter: UsageFilter) -> EngineResult<Vec<UsageEvent>> {
        filter.validate()?;
        let mut cursor = self.query(filter);
        let mut events = Vec::new();
        while let Some(page) = cursor.next_page() {
            events.extend(page);
            tokio::task::yield_now().await;
        }
        Ok(events)
    }

    pub async fn count(&self, filter: UsageFilter) -> EngineResult<u64> {
        filter.validate()?;
        let mut cursor = self.query(filter);
        let mut total = 0;
        while let Some(page) = cursor.next_page() {
            total += page.len() as u64;
            tokio::task::yield_now().await;
        }
        Ok(total)
    }

    /// Count matching events per group key
    ///
    /// Per-endpoint counts of one credential over exactly one bucket period
    /// are read from the buckets; everything else scans events.
    pub async fn summarize(
        &self,
        group_by: GroupBy,
        filter: UsageFilter,
    ) -> EngineResult<BTreeMap<String, u64>> {
        filter.validate()?;
        if let Some(groups) = self.summarize_from_buckets(group_by, &filter) {
            return Ok(groups);
        }
        let mut cursor = self.query(filter);
        let mut groups = BTreeMap::new();
        while let Some(page) = cursor.next_page() {
            for event in &page {
                *groups.entry(group_by.key(event)).or_insert(0) += 1;
            }
            tokio::task::yield_now().await;
        }
        Ok(groups)
    }

    fn summarize_from_buckets(
        &self,
        group_by: GroupBy,
        filter: &UsageFilter,
    ) -> Option<BTreeMap<String, u64>> {
        if group_by != GroupBy::Endpoint || filter.identifier.is_some() || filter.status.is_some()
        {
            return None;
        }
        if filter.endpoint.as_deref() == Some(NO_ENDPOINT) {
            return None;
        }
        let credential_id = filter.credential_id.as_ref()?;
        let (from, to) = (filter.from?, filter.to?);
        let granularity = self
            .buckets
            .granularities()
            .iter()
            .copied()
            .find(|granularity| granularity.bounds(from) == Some((from, to)))?;

        let scope = BucketScope::Credential(credential_id.clone());
        let mut counts =
            self.buckets
                .period_counts(&scope, granularity, &granularity.period_label(from));
        if let Some(endpoint) = &filter.endpoint {
            counts.retain(|key, _| key == endpoint);
        }
        debug!(
            key = fingerprint(credential_id),
            %granularity,
            "Summarized from buckets"
        );
        Some(counts)
    }

    /// Admitted/denied totals for one credential
    pub async fn summarize_for_credential(
        &self,
        credential_id: &str,
        endpoint: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> EngineResult<UsageSummary> {
        let filter = UsageFilter {
            credential_id: Some(credential_id.to_string()),
            endpoint: endpoint.map(str::to_string),
            from,
            to,
            ..UsageFilter::default()
        };
        let by_status = self.summarize(GroupBy::Status, filter).await?;
        let get = |status: UsageStatus| by_status.get(status.as_str()).copied().unwrap_or(0);
        Ok(UsageSummary {
            total: by_status.values().sum(),
            admitted: get(UsageStatus::Admitted),
            denied: get(UsageStatus::Denied),
        })
    }

    /// Delete matching events one at a time
    ///
    /// Each removal is taken back out of its buckets, so retention also
    /// drops buckets whose periods have aged out entirely.
    pub async fn delete(&self, filter: UsageFilter) -> EngineResult<u64> {
        filter.validate()?;
        if filter.is_unrestricted() {
            warn!("Deleting every usage event");
        }

        let mut targets = Vec::new();
        let mut cursor = self.query(filter);
        while let Some(page) = cursor.next_page() {
            targets.extend(page.into_iter().map(|event| (event.id, event.order_key())));
            tokio::task::yield_now().await;
        }

        let mut removed = 0;
        for (id, (timestamp, seq)) in targets {
            let _gate = self.write_gate.lock().await;
            if !self.events.read().contains_key(&(timestamp, seq)) {
                continue;
            }
            self.journal
                .append(&LedgerRecord::Deleted { id, seq, timestamp })
                .await?;
            if let Some(event) = self.events.write().remove(&(timestamp, seq)) {
                self.buckets.decrement(
                    &Self::scopes_of(&event),
                    event.endpoint_key(),
                    event.timestamp,
                );
            }
            removed += 1;
        }

        if removed > 0 {
            metrics::LEDGER_EVENTS_DELETED_TOTAL.inc_by(removed);
        }
        info!(removed, "Deleted usage events");
        Ok(removed)
    }

    /// Delete events older than the configured retention
    pub async fn apply_retention(&self) -> EngineResult<u64> {
        let Some(retention_secs) = self.config.retention_secs else {
            return Ok(0);
        };
        let retention = chrono::Duration::try_seconds(retention_secs as i64)
            .ok_or_else(|| EngineError::invalid("retention out of range"))?;
        let cutoff = self.clock.now() - retention;
        self.delete(UsageFilter::new().before(cutoff)).await
    }

    /// Bucket for the period of `granularity` containing `at`
    pub fn bucket(
        &self,
        scope: &BucketScope,
        endpoint: &str,
        granularity: Granularity,
        at: DateTime<Utc>,
    ) -> Option<StatsBucket> {
        self.buckets.get(scope, endpoint, granularity, at)
    }

    /// Every bucket of a scope
    pub fn stats(&self, scope: &BucketScope) -> Vec<StatsBucket> {
        self.buckets.list(scope)
    }

    /// Endpoint counts of one period, read from buckets
    pub fn period_counts(
        &self,
        scope: &BucketScope,
        granularity: Granularity,
        period: &str,
    ) -> BTreeMap<String, u64> {
        self.buckets.period_counts(scope, granularity, period)
    }

    pub fn granularities(&self) -> &[Granularity] {
        self.buckets.granularities()
    }

    /// Number of stored events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Paged, restartable scan over the ledger
///
/// The read lock is held only while a page is copied out, so dropping a
/// cursor part-way leaves nothing locked.
pub struct EventCursor<'a> {
    ledger: &'a UsageLedger,
    filter: UsageFilter,
    high_water: u64,
    after: Option<EventKey>,
    buffer: VecDeque<UsageEvent>,
    exhausted: bool,
}

impl EventCursor<'_> {
    /// Next non-empty page of matches, or `None` at the end
    pub fn next_page(&mut self) -> Option<Vec<UsageEvent>> {
        if !self.buffer.is_empty() {
            return Some(self.buffer.drain(..).collect());
        }
        while !self.exhausted {
            let page = self.fetch();
            if !page.is_empty() {
                return Some(page);
            }
        }
        None
    }

    fn fetch(&mut self) -> Vec<UsageEvent> {
        let events = self.ledger.events.read();
        let lower = match self.after {
            Some(key) => Bound::Excluded(key),
            None => match self.filter.from {
                Some(from) => Bound::Included((from, 0)),
                None => Bound::Unbounded,
            },
        };

        let mut scanned = 0;
        let mut page = Vec::new();
        for (key, event) in events.range((lower, Bound::Unbounded)) {
            if self.filter.to.is_some_and(|to| key.0 >= to) {
                self.exhausted = true;
                return page;
            }
            self.after = Some(*key);
            scanned += 1;
            if event.seq < self.high_water && self.filter.matches(event) {
                page.push(event.clone());
            }
            if scanned == PAGE_SIZE {
                return page;
            }
        }
        self.exhausted = true;
        page
    }
}

impl Iterator for EventCursor<'_> {
    type Item = UsageEvent;

    fn next(&mut self) -> Option<UsageEvent> {
        if self.buffer.is_empty() {
            let page = self.next_page()?;
            self.buffer.extend(page);
        }
        self.buffer.pop_front()
    }
}
