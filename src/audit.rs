//! Audit Trail
//!
//! Append-only record of security-relevant actions: who issued, revoked or
//! reactivated a credential, who changed roles or limits, who deleted usage.
//! Entries are journaled before they become visible and are never modified.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::journal::{Journal, MemoryJournal};
use crate::metrics;

/// Actor recorded when no caller credential was presented
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Audit trail configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Journal file; in-memory when unset
    pub journal_path: Option<String>,
}

/// Audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CredentialIssued,
    CredentialRevoked,
    CredentialReactivated,
    CredentialsSwept,
    RoleCreated,
    RoleAssigned,
    RoleRemoved,
    RateLimitUpserted,
    UsageDeleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CredentialIssued => "credential_issued",
            AuditAction::CredentialRevoked => "credential_revoked",
            AuditAction::CredentialReactivated => "credential_reactivated",
            AuditAction::CredentialsSwept => "credentials_swept",
            AuditAction::RoleCreated => "role_created",
            AuditAction::RoleAssigned => "role_assigned",
            AuditAction::RoleRemoved => "role_removed",
            AuditAction::RateLimitUpserted => "rate_limit_upserted",
            AuditAction::UsageDeleted => "usage_deleted",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub seq: u64,
    /// User the acting credential belongs to, or `anonymous`
    pub actor: String,
    pub action: AuditAction,
    /// Credential fingerprint, role name or user the action applied to
    pub target: Option<String>,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Entry selection; unset fields do not restrict
///
/// The time range is half-open: `from <= timestamp < to`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub target: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn validate(&self) -> EngineResult<()> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(EngineError::invalid("filter 'from' is after 'to'"));
            }
        }
        Ok(())
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor.as_deref().is_none_or(|actor| entry.actor == actor)
            && self.action.is_none_or(|action| entry.action == action)
            && self
                .target
                .as_deref()
                .is_none_or(|target| entry.target.as_deref() == Some(target))
            && self.from.is_none_or(|from| entry.timestamp >= from)
            && self.to.is_none_or(|to| entry.timestamp < to)
    }
}

/// Dimension for [`AuditLog::summarize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditGroupBy {
    #[default]
    Actor,
    Action,
}

/// Append-only audit trail
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    next_seq: AtomicU64,
    write_gate: tokio::sync::Mutex<()>,
    journal: Arc<dyn Journal<AuditEntry>>,
    clock: SharedClock,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    pub fn new(journal: Arc<dyn Journal<AuditEntry>>, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            write_gate: tokio::sync::Mutex::new(()),
            journal,
            clock,
        }
    }

    pub fn in_memory(clock: SharedClock) -> Self {
        Self::new(Arc::new(MemoryJournal::new()), clock)
    }

    /// Rebuild the trail from its journal
    pub async fn restore(
        journal: Arc<dyn Journal<AuditEntry>>,
        clock: SharedClock,
    ) -> EngineResult<Self> {
        let entries = journal.replay().await?;
        let log = Self::new(journal, clock);
        let max_seq = entries.iter().map(|entry| entry.seq).max().unwrap_or(0);
        log.next_seq.store(max_seq + 1, Ordering::SeqCst);
        info!(entries = entries.len(), "Restored audit trail from journal");
        *log.entries.write() = entries;
        Ok(log)
    }

    /// Append one entry; it is durable before it is visible
    pub async fn record(
        &self,
        actor: &str,
        action: AuditAction,
        target: Option<String>,
        details: Option<String>,
    ) -> EngineResult<AuditEntry> {
        let _gate = self.write_gate.lock().await;
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            actor: actor.to_string(),
            action,
            target,
            details,
            timestamp: self.clock.now(),
        };
        self.journal.append(&entry).await?;
        self.entries.write().push(entry.clone());
        info!(
            target: "keygate::audit",
            actor = %entry.actor,
            action = %entry.action,
            subject = entry.target.as_deref().unwrap_or("-"),
            "Audited action"
        );
        Ok(entry)
    }

    /// Like [`record`](Self::record), logging instead of failing
    ///
    /// For actions that already took effect, where an error would misreport
    /// the outcome.
    pub async fn record_or_warn(
        &self,
        actor: &str,
        action: AuditAction,
        target: Option<String>,
        details: Option<String>,
    ) {
        if let Err(e) = self.record(actor, action, target, details).await {
            metrics::AUDIT_WRITE_FAILURES_TOTAL.inc();
            warn!(actor, %action, error = %e, "Failed to write audit entry");
        }
    }

    /// Matching entries, newest first, after skipping `offset`
    pub fn query(
        &self,
        filter: &AuditFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> EngineResult<Vec<AuditEntry>> {
        filter.validate()?;
        let mut matching: Vec<AuditEntry> = self
            .entries
            .read()
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.timestamp, b.seq).cmp(&(a.timestamp, a.seq)));
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Count matching entries per actor or per action
    pub fn summarize(
        &self,
        group_by: AuditGroupBy,
        filter: &AuditFilter,
    ) -> EngineResult<BTreeMap<String, u64>> {
        filter.validate()?;
        let mut groups = BTreeMap::new();
        for entry in self.entries.read().iter().filter(|entry| filter.matches(entry)) {
            let key = match group_by {
                AuditGroupBy::Actor => entry.actor.clone(),
                AuditGroupBy::Action => entry.action.as_str().to_string(),
            };
            *groups.entry(key).or_insert(0) += 1;
        }
        Ok(groups)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
