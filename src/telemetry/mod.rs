//! Telemetry Module
//!
//! Live dashboard subscriptions fed from the usage ledger.
//!
//! ```text
//! UsageLedger ──delta──► broadcast ──► fan-out task ──► per-subscription queue ──► SSE
//!                                         │               (bounded, drop-oldest)
//!                                         └─ snapshot = user buckets for the current period
//! ```
//!
//! The fan-out task runs apart from request handling; a slow dashboard only
//! loses intermediate snapshots, it never delays a ledger write.

pub mod broadcaster;
pub mod queue;

pub use broadcaster::{DashboardSnapshot, DashboardSubscription, TelemetryBroadcaster, TelemetryConfig};
pub use queue::SubscriptionQueue;
