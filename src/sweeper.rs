//! Background maintenance
//!
//! Each sweep runs on its own interval task. Sweeps work record by record,
//! so they run alongside live traffic without a bulk lock.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::credentials::CredentialStore;
use crate::ledger::UsageLedger;
use crate::rate_limit::RateLimiter;

/// Handles of the running sweep tasks
#[derive(Debug, Default)]
pub struct Sweeper {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

fn spawn_every<F, Fut>(period: Duration, mut sweep: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep().await;
        }
    })
}

impl Sweeper {
    /// Start the expiry, retention and idle-counter sweeps
    ///
    /// Retention is only scheduled when the ledger has a retention period.
    pub fn start(
        credentials: Arc<CredentialStore>,
        ledger: Arc<UsageLedger>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let mut tasks = Vec::new();

        let period = Duration::from_secs(credentials.config().sweep_interval_secs);
        let expiry_limiter = limiter.clone();
        tasks.push((
            "credential expiry",
            spawn_every(period, move || {
                let credentials = credentials.clone();
                let limiter = expiry_limiter.clone();
                async move {
                    match credentials.remove_expired().await {
                        Ok(removed) => {
                            limiter.forget_credentials(&removed);
                        }
                        Err(e) => error!("Credential expiry sweep failed: {}", e),
                    }
                }
            }),
        ));

        if ledger.config().retention_secs.is_some() {
            let period = Duration::from_secs(ledger.config().sweep_interval_secs);
            tasks.push((
                "ledger retention",
                spawn_every(period, move || {
                    let ledger = ledger.clone();
                    async move {
                        if let Err(e) = ledger.apply_retention().await {
                            error!("Ledger retention sweep failed: {}", e);
                        }
                    }
                }),
            ));
        }

        let period = Duration::from_secs(limiter.settings().prune_interval_secs);
        tasks.push((
            "idle counters",
            spawn_every(period, move || {
                let limiter = limiter.clone();
                async move {
                    let pruned = limiter.prune_idle_counters();
                    debug!(pruned, "Pruned idle rate limit counters");
                }
            }),
        ));

        Self { tasks }
    }

    /// Names of the running sweeps
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Abort every sweep task
    pub fn stop(&mut self) {
        for (name, task) in self.tasks.drain(..) {
            task.abort();
            debug!("Stopped {} sweep", name);
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
