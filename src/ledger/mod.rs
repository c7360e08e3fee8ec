//! Usage Ledger Module
//!
//! Append-only usage events, time-bucketed statistics derived from them, and
//! the aggregation deltas that feed live dashboards.
//!
//! # Data flow
//!
//! ```text
//! record ──► journal (retry/backoff) ──► event index ──► buckets ──► delta
//!                                        (ts, seq)      hour/day/   (broadcast)
//!                                                       month
//! ```
//!
//! Buckets are maintained per credential and per owning user, and deletes
//! are taken back out of them. Reading a period's totals goes through the
//! buckets, as does `summarize` by endpoint over one whole bucket period;
//! other queries scan raw events page by page.

pub mod buckets;
pub mod event;
pub mod store;

pub use buckets::{BucketIndex, BucketScope, Granularity, StatsBucket};
pub use event::{GroupBy, UsageEvent, UsageFilter, UsageStatus, UsageSummary, NO_ENDPOINT};
pub use store::{
    AccountingFailurePolicy, AggregationDelta, EventCursor, LedgerConfig, LedgerRecord,
    UsageLedger,
};
