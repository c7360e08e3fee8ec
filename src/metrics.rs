// Prometheus metrics for the keygate engine
//
// Exposes metrics on the /metrics HTTP endpoint:
// - Credential issuance, revocation and validation outcomes (counters)
// - Admission decisions and check latency (counter, histogram)
// - Ledger writes, retries and retention deletes (counters)
// - Live dashboard subscriptions and snapshot delivery (gauge, counters)

use lazy_static::lazy_static;
use prometheus::{
    core::Collector, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Credential metrics
    pub static ref CREDENTIALS_ISSUED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("keygate_credentials_issued_total", "Total number of credentials issued"),
        &["kind"]
    ).expect("Failed to create credentials issued metric");

    pub static ref CREDENTIALS_REVOKED_TOTAL: IntCounter = IntCounter::new(
        "keygate_credentials_revoked_total",
        "Total number of credential revocations"
    ).expect("Failed to create credentials revoked metric");

    pub static ref CREDENTIAL_VALIDATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("keygate_credential_validations_total", "Credential validations by outcome"),
        &["outcome"]
    ).expect("Failed to create credential validations metric");

    pub static ref CREDENTIALS_SWEPT_TOTAL: IntCounter = IntCounter::new(
        "keygate_credentials_swept_total",
        "Total number of expired credentials removed by sweeps"
    ).expect("Failed to create credentials swept metric");

    // Rate limiter metrics
    pub static ref ADMISSION_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("keygate_admission_decisions_total", "Rate limiter decisions"),
        &["decision"]
    ).expect("Failed to create admission decisions metric");

    pub static ref ADMISSION_CHECK_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("keygate_admission_check_duration_seconds", "Time spent in a rate limit check")
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01]),
    ).expect("Failed to create admission check duration metric");

    // Ledger metrics
    pub static ref LEDGER_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("keygate_ledger_events_total", "Usage events recorded by status"),
        &["status"]
    ).expect("Failed to create ledger events metric");

    pub static ref LEDGER_WRITE_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "keygate_ledger_write_retries_total",
        "Total number of retried ledger journal writes"
    ).expect("Failed to create ledger write retries metric");

    pub static ref LEDGER_EVENTS_DELETED_TOTAL: IntCounter = IntCounter::new(
        "keygate_ledger_events_deleted_total",
        "Total number of usage events deleted"
    ).expect("Failed to create ledger events deleted metric");

    pub static ref ACCOUNTING_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "keygate_accounting_failures_total",
        "Requests whose usage event could not be written"
    ).expect("Failed to create accounting failures metric");

    // Telemetry metrics
    pub static ref TELEMETRY_SUBSCRIPTIONS_ACTIVE: IntGauge = IntGauge::new(
        "keygate_telemetry_subscriptions_active",
        "Number of live dashboard subscriptions"
    ).expect("Failed to create telemetry subscriptions metric");

    pub static ref TELEMETRY_SNAPSHOTS_PUSHED_TOTAL: IntCounter = IntCounter::new(
        "keygate_telemetry_snapshots_pushed_total",
        "Total number of dashboard snapshots queued"
    ).expect("Failed to create telemetry snapshots pushed metric");

    pub static ref TELEMETRY_SNAPSHOTS_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "keygate_telemetry_snapshots_dropped_total",
        "Snapshots discarded because a subscriber queue was full"
    ).expect("Failed to create telemetry snapshots dropped metric");

    // Audit metrics
    pub static ref AUDIT_WRITE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "keygate_audit_write_failures_total",
        "Audit entries that could not be journaled"
    ).expect("Failed to create audit write failures metric");
}

fn register(collector: Box<dyn Collector>) -> prometheus::Result<()> {
    match REGISTRY.register(collector) {
        Err(prometheus::Error::AlreadyReg) => Ok(()),
        other => other,
    }
}

/// Register every metric with the registry; safe to call more than once
pub fn init() -> prometheus::Result<()> {
    register(Box::new(CREDENTIALS_ISSUED_TOTAL.clone()))?;
    register(Box::new(CREDENTIALS_REVOKED_TOTAL.clone()))?;
    register(Box::new(CREDENTIAL_VALIDATIONS_TOTAL.clone()))?;
    register(Box::new(CREDENTIALS_SWEPT_TOTAL.clone()))?;
    register(Box::new(ADMISSION_DECISIONS_TOTAL.clone()))?;
    register(Box::new(ADMISSION_CHECK_DURATION_SECONDS.clone()))?;
    register(Box::new(LEDGER_EVENTS_TOTAL.clone()))?;
    register(Box::new(LEDGER_WRITE_RETRIES_TOTAL.clone()))?;
    register(Box::new(LEDGER_EVENTS_DELETED_TOTAL.clone()))?;
    register(Box::new(ACCOUNTING_FAILURES_TOTAL.clone()))?;
    register(Box::new(TELEMETRY_SUBSCRIPTIONS_ACTIVE.clone()))?;
    register(Box::new(TELEMETRY_SNAPSHOTS_PUSHED_TOTAL.clone()))?;
    register(Box::new(TELEMETRY_SNAPSHOTS_DROPPED_TOTAL.clone()))?;
    register(Box::new(AUDIT_WRITE_FAILURES_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_gather_includes_engine_metrics() {
        init().unwrap();
        CREDENTIALS_ISSUED_TOTAL.with_label_values(&["api_key"]).inc();
        ADMISSION_DECISIONS_TOTAL.with_label_values(&["admit"]).inc();

        let text = gather_metrics().unwrap();
        assert!(text.contains("keygate_credentials_issued_total"));
        assert!(text.contains("keygate_admission_decisions_total"));
    }
}
