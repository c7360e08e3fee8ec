//! Engine
//!
//! Wires the credential store, authorization engine, rate limiter, usage
//! ledger and telemetry broadcaster together and runs the request path:
//!
//! ```text
//! credential ──validate──► rate limiter ──Admit/Deny──► usage ledger ──delta──► telemetry
//!      │                                                     ▲
//!      └──────────── rejected (NotFound/Revoked/Expired) ────┘
//! ```
//!
//! Every admission check produces exactly one usage event, whatever the
//! outcome.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditLog, ANONYMOUS_ACTOR};
use crate::authz::AuthorizationEngine;
use crate::clock::SharedClock;
use crate::config::{Config, ServerConfig};
use crate::credentials::keygen::fingerprint;
use crate::credentials::{Credential, CredentialEvent, CredentialStore, OwnerResolver};
use crate::error::{EngineError, EngineResult};
use crate::journal::{FileJournal, Journal, MemoryJournal};
use crate::ledger::{
    AccountingFailurePolicy, GroupBy, LedgerRecord, UsageEvent, UsageFilter, UsageLedger,
    UsageStatus,
};
use crate::metrics;
use crate::rate_limit::{Admission, RateLimiter};
use crate::sweeper::Sweeper;
use crate::telemetry::{DashboardSubscription, TelemetryBroadcaster};

struct Background {
    sweeper: Sweeper,
    fanout: JoinHandle<()>,
}

/// Credential and quota enforcement engine
pub struct Engine {
    credentials: Arc<CredentialStore>,
    authz: Arc<AuthorizationEngine>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<UsageLedger>,
    telemetry: TelemetryBroadcaster,
    audit: Arc<AuditLog>,
    server: ServerConfig,
    background: Mutex<Option<Background>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("credentials", &self.credentials)
            .field("limiter", &self.limiter)
            .field("ledger", &self.ledger)
            .field("telemetry", &self.telemetry)
            .field("running", &self.background.lock().is_some())
            .finish()
    }
}

impl Engine {
    /// Open the engine, replaying any configured journals
    pub async fn open(config: &Config, clock: SharedClock) -> EngineResult<Self> {
        let credential_journal: Arc<dyn Journal<CredentialEvent>> =
            match &config.credentials.journal_path {
                Some(path) => Arc::new(FileJournal::open(path).await?),
                None => Arc::new(MemoryJournal::new()),
            };
        let credentials = Arc::new(
            CredentialStore::restore(
                config.credentials.clone(),
                credential_journal,
                clock.clone(),
            )
            .await?,
        );

        let ledger_journal: Arc<dyn Journal<LedgerRecord>> = match &config.ledger.journal_path {
            Some(path) => Arc::new(FileJournal::open(path).await?),
            None => Arc::new(MemoryJournal::new()),
        };
        let owners: Arc<dyn OwnerResolver> = credentials.clone();
        let ledger = Arc::new(
            UsageLedger::restore(
                config.ledger.clone(),
                ledger_journal,
                Some(owners),
                clock.clone(),
            )
            .await?,
        );

        let audit_journal: Arc<dyn Journal<AuditEntry>> = match &config.audit.journal_path {
            Some(path) => Arc::new(FileJournal::open(path).await?),
            None => Arc::new(MemoryJournal::new()),
        };
        let audit = Arc::new(AuditLog::restore(audit_journal, clock.clone()).await?);

        Self::from_parts(config, clock, credentials, ledger, audit)
    }

    /// Engine with in-memory journals
    pub fn in_memory(config: &Config, clock: SharedClock) -> EngineResult<Self> {
        let credentials = Arc::new(CredentialStore::in_memory(
            config.credentials.clone(),
            clock.clone(),
        ));
        let owners: Arc<dyn OwnerResolver> = credentials.clone();
        let ledger = Arc::new(UsageLedger::in_memory(
            config.ledger.clone(),
            Some(owners),
            clock.clone(),
        ));
        let audit = Arc::new(AuditLog::in_memory(clock.clone()));
        Self::from_parts(config, clock, credentials, ledger, audit)
    }

    /// Assemble around an existing credential store, ledger and audit trail
    ///
    /// Creates the admin role and binds the configured admin users.
    pub fn from_parts(
        config: &Config,
        clock: SharedClock,
        credentials: Arc<CredentialStore>,
        ledger: Arc<UsageLedger>,
        audit: Arc<AuditLog>,
    ) -> EngineResult<Self> {
        let authz = Arc::new(AuthorizationEngine::new(clock.clone()));
        if let Some(role) = &config.server.admin_role {
            match authz.create_role(role, "Engine administrators") {
                Ok(_) | Err(EngineError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
            for user in &config.server.admin_users {
                authz.assign(user, role)?;
            }
        }

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            credentials.clone(),
            clock,
        ));
        let telemetry = TelemetryBroadcaster::new(config.telemetry.clone(), ledger.clone());

        Ok(Self {
            credentials,
            authz,
            limiter,
            ledger,
            telemetry,
            audit,
            server: config.server.clone(),
            background: Mutex::new(None),
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn authz(&self) -> &Arc<AuthorizationEngine> {
        &self.authz
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub fn telemetry(&self) -> &TelemetryBroadcaster {
        &self.telemetry
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Sweep expired tokens and drop their rate-limit configs and counters
    pub async fn cleanup_expired(&self) -> EngineResult<usize> {
        let removed = self.credentials.remove_expired().await?;
        self.limiter.forget_credentials(&removed);
        Ok(removed.len())
    }

    /// Start the telemetry fan-out and the maintenance sweeps
    ///
    /// Calling it again while running does nothing.
    pub fn start_background(&self) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }
        let fanout = self.telemetry.spawn_fanout();
        let sweeper = Sweeper::start(
            self.credentials.clone(),
            self.ledger.clone(),
            self.limiter.clone(),
        );
        info!(sweeps = ?sweeper.names(), "Started background tasks");
        *background = Some(Background { sweeper, fanout });
    }

    /// Stop background tasks and close every dashboard subscription
    pub fn shutdown(&self) {
        if let Some(mut background) = self.background.lock().take() {
            background.sweeper.stop();
            background.fanout.abort();
            info!("Stopped background tasks");
        }
        self.telemetry.close_all();
    }

    pub fn is_running(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Resolve the calling credential
    ///
    /// An unknown credential is `Unauthorized`; revoked and expired ones keep
    /// their own error so callers can tell "renew" from "denied".
    pub fn authenticate(&self, caller: Option<&str>) -> EngineResult<Credential> {
        let caller =
            caller.ok_or_else(|| EngineError::Unauthorized("missing credential".to_string()))?;
        self.credentials
            .validate(caller, true)
            .map_err(|err| match err {
                EngineError::NotFound { .. } => {
                    EngineError::Unauthorized(format!("unknown credential {}", fingerprint(caller)))
                }
                other => other,
            })
    }

    /// User an audit entry is attributed to
    ///
    /// Unknown, revoked or missing callers are recorded as `anonymous`.
    pub fn actor_of(&self, caller: Option<&str>) -> String {
        caller
            .and_then(|id| self.credentials.get(id).ok())
            .map(|credential| credential.owner_id)
            .unwrap_or_else(|| ANONYMOUS_ACTOR.to_string())
    }

    /// Require the caller's owner to hold the admin role
    ///
    /// Without an admin role configured every caller passes.
    pub fn authorize_admin(&self, caller: Option<&str>) -> EngineResult<()> {
        let Some(role) = &self.server.admin_role else {
            return Ok(());
        };
        let credential = self.authenticate(caller)?;
        self.authz.require_role(&credential.owner_id, role)
    }

    /// Require the caller to act for `user_id`, or to be an admin
    pub fn authorize_user(&self, caller: Option<&str>, user_id: &str) -> EngineResult<()> {
        let Some(role) = &self.server.admin_role else {
            return Ok(());
        };
        let credential = self.authenticate(caller)?;
        if credential.owner_id == user_id {
            return Ok(());
        }
        self.authz.require_role(&credential.owner_id, role)
    }

    /// Require the caller to own `credential_id`, or to be an admin
    pub fn authorize_credential(&self, caller: Option<&str>, credential_id: &str) -> EngineResult<()> {
        if self.server.admin_role.is_none() {
            return Ok(());
        }
        let owner = self.credentials.get(credential_id)?.owner_id;
        self.authorize_user(caller, &owner)
    }

    /// Validate, rate-limit and account one request
    ///
    /// A denial is `Ok(Admission::Deny { .. })`. Credential failures are
    /// recorded as `rejected` and then returned as errors. If the usage event
    /// cannot be written the configured accounting policy decides whether the
    /// call fails with `Unavailable`.
    pub async fn check_and_admit(
        &self,
        credential_id: &str,
        endpoint: &str,
        identifier: &str,
    ) -> EngineResult<Admission> {
        if endpoint.trim().is_empty() {
            return Err(EngineError::invalid("endpoint must not be empty"));
        }

        match self.limiter.check_and_admit(credential_id, endpoint) {
            Ok(admission) => {
                let status = if admission.is_admitted() {
                    self.credentials.touch(credential_id);
                    UsageStatus::Admitted
                } else {
                    UsageStatus::Denied
                };
                self.account(credential_id, endpoint, identifier, status)
                    .await?;
                Ok(admission)
            }
            Err(err) => {
                if let Err(accounting) = self
                    .account(credential_id, endpoint, identifier, UsageStatus::Rejected)
                    .await
                {
                    warn!(
                        key = fingerprint(credential_id),
                        error = %accounting,
                        "Rejected request was not accounted"
                    );
                }
                Err(err)
            }
        }
    }

    async fn account(
        &self,
        credential_id: &str,
        endpoint: &str,
        identifier: &str,
        status: UsageStatus,
    ) -> EngineResult<()> {
        match self
            .ledger
            .record(credential_id, Some(endpoint), identifier, status)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                metrics::ACCOUNTING_FAILURES_TOTAL.inc();
                match self.ledger.config().on_accounting_failure {
                    AccountingFailurePolicy::FailRequest => Err(err),
                    AccountingFailurePolicy::Proceed => {
                        warn!(
                            key = fingerprint(credential_id),
                            endpoint,
                            error = %err,
                            "Proceeding without accounting"
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.server.query_timeout_secs)
    }

    async fn bounded<T>(&self, fut: impl Future<Output = EngineResult<T>>) -> EngineResult<T> {
        let timeout = self.query_timeout();
        tokio::time::timeout(timeout, fut).await.map_err(|_| {
            EngineError::Unavailable(format!("query timed out after {}s", timeout.as_secs()))
        })?
    }

    /// Matching events, cancelled after the query timeout
    pub async fn query_usage(&self, filter: UsageFilter) -> EngineResult<Vec<UsageEvent>> {
        self.bounded(self.ledger.query_all(filter)).await
    }

    pub async fn count_usage(&self, filter: UsageFilter) -> EngineResult<u64> {
        self.bounded(self.ledger.count(filter)).await
    }

    pub async fn summarize_usage(
        &self,
        group_by: GroupBy,
        filter: UsageFilter,
    ) -> EngineResult<BTreeMap<String, u64>> {
        self.bounded(self.ledger.summarize(group_by, filter)).await
    }

    pub async fn delete_usage(&self, filter: UsageFilter) -> EngineResult<u64> {
        self.bounded(self.ledger.delete(filter)).await
    }

    /// Open a live dashboard for `user_id`
    pub fn subscribe_dashboard(&self, user_id: &str) -> EngineResult<DashboardSubscription> {
        self.telemetry.subscribe(user_id)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(background) = self.background.get_mut().take() {
            background.fanout.abort();
        }
    }
}
