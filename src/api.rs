//! Request/response envelope
//!
//! Every engine operation is one variant of [`EngineRequest`]. Requests are
//! validated here before any component sees them, then dispatched by
//! [`Engine::handle`] with the caller's credential.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::audit::{AuditAction, AuditEntry, AuditFilter, AuditGroupBy};
use crate::authz::{Role, UserRoleBinding};
use crate::credentials::keygen::fingerprint;
use crate::credentials::{Credential, CredentialKind};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{
    BucketScope, GroupBy, StatsBucket, UsageEvent, UsageFilter, UsageStatus, UsageSummary,
};
use crate::rate_limit::config::validate_limit;
use crate::rate_limit::{Admission, RateLimitConfig, WindowStrategy, WindowUsage};
use crate::telemetry::DashboardSnapshot;

fn default_true() -> bool {
    true
}

fn default_kind() -> CredentialKind {
    CredentialKind::ApiKey
}

/// One engine operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EngineRequest {
    // Credentials
    IssueCredential {
        owner_id: String,
        #[serde(default = "default_kind")]
        kind: CredentialKind,
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
    RevokeCredential {
        id: String,
    },
    ReactivateCredential {
        id: String,
    },
    ValidateCredential {
        id: String,
        #[serde(default = "default_true")]
        check_expiry: bool,
        /// When set, the credential must also belong to this owner
        #[serde(default)]
        owner_id: Option<String>,
    },
    GetCredential {
        id: String,
    },
    ListCredentials {
        owner_id: String,
    },
    CountCredentials {
        #[serde(default)]
        owner_id: Option<String>,
        #[serde(default)]
        active_only: bool,
    },
    CleanupExpired,

    // Authorization
    CreateRole {
        name: String,
        #[serde(default)]
        description: String,
    },
    GetRole {
        name: String,
    },
    ListRoles,
    AssignRole {
        user_id: String,
        role_name: String,
    },
    ListUserRoles {
        user_id: String,
    },
    HasRole {
        user_id: String,
        role_name: String,
    },
    RemoveRole {
        user_id: String,
        role_id: u64,
    },

    // Rate limiting
    CheckAndAdmit {
        credential_id: String,
        endpoint: String,
        #[serde(default)]
        identifier: String,
    },
    GetRateLimits {
        credential_id: String,
    },
    UpsertRateLimit {
        credential_id: String,
        endpoint: String,
        limit: u32,
        period_secs: u64,
        #[serde(default)]
        strategy: WindowStrategy,
    },
    RateLimitUsage {
        credential_id: String,
        #[serde(default)]
        endpoint: Option<String>,
    },

    // Usage ledger
    RecordUsage {
        credential_id: String,
        #[serde(default)]
        endpoint: Option<String>,
        identifier: String,
        status: UsageStatus,
    },
    QueryUsage {
        #[serde(default)]
        filter: UsageFilter,
    },
    DeleteUsage {
        #[serde(default)]
        filter: UsageFilter,
    },
    CountUsage {
        #[serde(default)]
        filter: UsageFilter,
    },
    SummarizeUsage {
        #[serde(default)]
        group_by: GroupBy,
        #[serde(default)]
        filter: UsageFilter,
    },
    SummarizeCredential {
        credential_id: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        from: Option<DateTime<Utc>>,
        #[serde(default)]
        to: Option<DateTime<Utc>>,
    },
    UsageStats {
        scope: BucketScope,
    },

    // Telemetry
    DashboardSnapshot {
        user_id: String,
    },

    // Audit trail
    ExportAudit {
        #[serde(default)]
        filter: AuditFilter,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        offset: usize,
    },
    SummarizeAudit {
        #[serde(default)]
        group_by: AuditGroupBy,
        #[serde(default)]
        filter: AuditFilter,
    },
}

/// Result of one engine operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum EngineResponse {
    Done,
    Credential(Credential),
    Credentials(Vec<Credential>),
    Count(u64),
    Flag(bool),
    Role(Role),
    Roles(Vec<Role>),
    Binding(UserRoleBinding),
    Admission(Admission),
    RateLimit(RateLimitConfig),
    RateLimits(Vec<RateLimitConfig>),
    WindowUsage(BTreeMap<String, WindowUsage>),
    Event(UsageEvent),
    Events(Vec<UsageEvent>),
    Groups(BTreeMap<String, u64>),
    Summary(UsageSummary),
    Buckets(Vec<StatsBucket>),
    Snapshot(DashboardSnapshot),
    AuditEntries(Vec<AuditEntry>),
}

/// Error body returned at the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: crate::error::ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&EngineError> for ErrorBody {
    fn from(err: &EngineError) -> Self {
        let retry_after_ms = match err {
            EngineError::RateLimited { retry_after } => Some(retry_after.as_millis() as u64),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retry_after_ms,
        }
    }
}

fn require(field: &str, value: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        Err(EngineError::invalid(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}

fn require_scope(scope: &BucketScope) -> EngineResult<()> {
    match scope {
        BucketScope::Credential(id) => require("credential_id", id),
        BucketScope::User(id) => require("user_id", id),
    }
}

impl EngineRequest {
    /// Operation name as it appears in the `op` tag
    pub fn name(&self) -> &'static str {
        match self {
            EngineRequest::IssueCredential { .. } => "issue_credential",
            EngineRequest::RevokeCredential { .. } => "revoke_credential",
            EngineRequest::ReactivateCredential { .. } => "reactivate_credential",
            EngineRequest::ValidateCredential { .. } => "validate_credential",
            EngineRequest::GetCredential { .. } => "get_credential",
            EngineRequest::ListCredentials { .. } => "list_credentials",
            EngineRequest::CountCredentials { .. } => "count_credentials",
            EngineRequest::CleanupExpired => "cleanup_expired",
            EngineRequest::CreateRole { .. } => "create_role",
            EngineRequest::GetRole { .. } => "get_role",
            EngineRequest::ListRoles => "list_roles",
            EngineRequest::AssignRole { .. } => "assign_role",
            EngineRequest::ListUserRoles { .. } => "list_user_roles",
            EngineRequest::HasRole { .. } => "has_role",
            EngineRequest::RemoveRole { .. } => "remove_role",
            EngineRequest::CheckAndAdmit { .. } => "check_and_admit",
            EngineRequest::GetRateLimits { .. } => "get_rate_limits",
            EngineRequest::UpsertRateLimit { .. } => "upsert_rate_limit",
            EngineRequest::RateLimitUsage { .. } => "rate_limit_usage",
            EngineRequest::RecordUsage { .. } => "record_usage",
            EngineRequest::QueryUsage { .. } => "query_usage",
            EngineRequest::DeleteUsage { .. } => "delete_usage",
            EngineRequest::CountUsage { .. } => "count_usage",
            EngineRequest::SummarizeUsage { .. } => "summarize_usage",
            EngineRequest::SummarizeCredential { .. } => "summarize_credential",
            EngineRequest::UsageStats { .. } => "usage_stats",
            EngineRequest::DashboardSnapshot { .. } => "dashboard_snapshot",
            EngineRequest::ExportAudit { .. } => "export_audit",
            EngineRequest::SummarizeAudit { .. } => "summarize_audit",
        }
    }

    /// Reject malformed input before dispatch
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            EngineRequest::IssueCredential {
                owner_id, ttl_secs, ..
            } => {
                require("owner_id", owner_id)?;
                if *ttl_secs == Some(0) {
                    return Err(EngineError::invalid("ttl_secs must be positive"));
                }
                Ok(())
            }
            EngineRequest::ValidateCredential { id, owner_id, .. } => {
                require("id", id)?;
                match owner_id {
                    Some(owner_id) => require("owner_id", owner_id),
                    None => Ok(()),
                }
            }
            EngineRequest::RevokeCredential { id }
            | EngineRequest::ReactivateCredential { id }
            | EngineRequest::GetCredential { id } => require("id", id),
            EngineRequest::ListCredentials { owner_id } => require("owner_id", owner_id),
            EngineRequest::CountCredentials { owner_id, .. } => match owner_id {
                Some(owner_id) => require("owner_id", owner_id),
                None => Ok(()),
            },
            EngineRequest::CleanupExpired | EngineRequest::ListRoles => Ok(()),
            EngineRequest::CreateRole { name, .. } | EngineRequest::GetRole { name } => {
                require("name", name)
            }
            EngineRequest::AssignRole { user_id, role_name }
            | EngineRequest::HasRole { user_id, role_name } => {
                require("user_id", user_id)?;
                require("role_name", role_name)
            }
            EngineRequest::ListUserRoles { user_id }
            | EngineRequest::RemoveRole { user_id, .. }
            | EngineRequest::DashboardSnapshot { user_id } => require("user_id", user_id),
            EngineRequest::CheckAndAdmit {
                credential_id,
                endpoint,
                ..
            } => {
                require("credential_id", credential_id)?;
                require("endpoint", endpoint)
            }
            EngineRequest::GetRateLimits { credential_id }
            | EngineRequest::RateLimitUsage { credential_id, .. }
            | EngineRequest::SummarizeCredential { credential_id, .. } => {
                require("credential_id", credential_id)
            }
            EngineRequest::UpsertRateLimit {
                credential_id,
                endpoint,
                limit,
                period_secs,
                ..
            } => {
                require("credential_id", credential_id)?;
                require("endpoint", endpoint)?;
                validate_limit(*limit, *period_secs)
            }
            EngineRequest::RecordUsage {
                credential_id,
                status,
                ..
            } => {
                require("credential_id", credential_id)?;
                require("status", status.as_str())
            }
            EngineRequest::QueryUsage { filter }
            | EngineRequest::DeleteUsage { filter }
            | EngineRequest::CountUsage { filter }
            | EngineRequest::SummarizeUsage { filter, .. } => filter.validate(),
            EngineRequest::UsageStats { scope } => require_scope(scope),
            EngineRequest::ExportAudit { filter, .. }
            | EngineRequest::SummarizeAudit { filter, .. } => filter.validate(),
        }
    }
}

impl Engine {
    /// Ledger reads scoped to one credential are open to its owner; the
    /// rest need the admin role
    fn authorize_filter(&self, caller: Option<&str>, filter: &UsageFilter) -> EngineResult<()> {
        match &filter.credential_id {
            Some(id) => self.authorize_credential(caller, id),
            None => self.authorize_admin(caller),
        }
    }

    async fn audit_action(
        &self,
        caller: Option<&str>,
        action: AuditAction,
        target: Option<String>,
        details: Option<String>,
    ) {
        let actor = self.actor_of(caller);
        self.audit()
            .record_or_warn(&actor, action, target, details)
            .await;
    }

    /// Validate, authorize and run one request on behalf of `caller`
    ///
    /// Credential, role, limit and usage-deletion changes are written to the
    /// audit trail once they have taken effect.
    pub async fn handle(
        &self,
        caller: Option<&str>,
        request: EngineRequest,
    ) -> EngineResult<EngineResponse> {
        request.validate()?;
        debug!(op = request.name(), "Handling engine request");

        let response = match request {
            EngineRequest::IssueCredential {
                owner_id,
                kind,
                ttl_secs,
            } => {
                self.authorize_user(caller, &owner_id)?;
                let credential = self
                    .credentials()
                    .issue(&owner_id, kind, ttl_secs.map(Duration::from_secs))
                    .await?;
                self.audit_action(
                    caller,
                    AuditAction::CredentialIssued,
                    Some(fingerprint(&credential.id).to_string()),
                    Some(format!("owner={} kind={}", owner_id, kind.as_str())),
                )
                .await;
                EngineResponse::Credential(credential)
            }
            EngineRequest::RevokeCredential { id } => {
                self.authorize_credential(caller, &id)?;
                self.credentials().revoke(&id).await?;
                self.audit_action(
                    caller,
                    AuditAction::CredentialRevoked,
                    Some(fingerprint(&id).to_string()),
                    None,
                )
                .await;
                EngineResponse::Done
            }
            EngineRequest::ReactivateCredential { id } => {
                self.authorize_credential(caller, &id)?;
                self.credentials().reactivate(&id).await?;
                self.audit_action(
                    caller,
                    AuditAction::CredentialReactivated,
                    Some(fingerprint(&id).to_string()),
                    None,
                )
                .await;
                EngineResponse::Done
            }
            EngineRequest::ValidateCredential {
                id,
                check_expiry,
                owner_id,
            } => match owner_id {
                Some(owner_id) => {
                    EngineResponse::Credential(self.credentials().validate_for_owner(&id, &owner_id)?)
                }
                None => EngineResponse::Credential(self.credentials().validate(&id, check_expiry)?),
            },
            EngineRequest::GetCredential { id } => {
                self.authorize_credential(caller, &id)?;
                EngineResponse::Credential(self.credentials().get(&id)?)
            }
            EngineRequest::ListCredentials { owner_id } => {
                self.authorize_user(caller, &owner_id)?;
                EngineResponse::Credentials(self.credentials().list_by_owner(&owner_id))
            }
            EngineRequest::CountCredentials {
                owner_id,
                active_only,
            } => {
                match &owner_id {
                    Some(owner_id) => self.authorize_user(caller, owner_id)?,
                    None => self.authorize_admin(caller)?,
                }
                EngineResponse::Count(
                    self.credentials()
                        .count(owner_id.as_deref(), active_only) as u64,
                )
            }
            EngineRequest::CleanupExpired => {
                self.authorize_admin(caller)?;
                let removed = self.cleanup_expired().await?;
                self.audit_action(
                    caller,
                    AuditAction::CredentialsSwept,
                    None,
                    Some(format!("removed={}", removed)),
                )
                .await;
                EngineResponse::Count(removed as u64)
            }

            EngineRequest::CreateRole { name, description } => {
                self.authorize_admin(caller)?;
                let role = self.authz().create_role(&name, &description)?;
                self.audit_action(caller, AuditAction::RoleCreated, Some(name), None)
                    .await;
                EngineResponse::Role(role)
            }
            EngineRequest::GetRole { name } => EngineResponse::Role(self.authz().get_role(&name)?),
            EngineRequest::ListRoles => EngineResponse::Roles(self.authz().list_roles()),
            EngineRequest::AssignRole { user_id, role_name } => {
                self.authorize_admin(caller)?;
                let binding = self.authz().assign(&user_id, &role_name)?;
                self.audit_action(
                    caller,
                    AuditAction::RoleAssigned,
                    Some(user_id),
                    Some(format!("role={}", role_name)),
                )
                .await;
                EngineResponse::Binding(binding)
            }
            EngineRequest::ListUserRoles { user_id } => {
                EngineResponse::Roles(self.authz().list_for_user(&user_id))
            }
            EngineRequest::HasRole { user_id, role_name } => {
                EngineResponse::Flag(self.authz().has_role(&user_id, &role_name))
            }
            EngineRequest::RemoveRole { user_id, role_id } => {
                self.authorize_admin(caller)?;
                self.authz().remove(&user_id, role_id)?;
                self.audit_action(
                    caller,
                    AuditAction::RoleRemoved,
                    Some(user_id),
                    Some(format!("role_id={}", role_id)),
                )
                .await;
                EngineResponse::Done
            }

            EngineRequest::CheckAndAdmit {
                credential_id,
                endpoint,
                identifier,
            } => EngineResponse::Admission(
                self.check_and_admit(&credential_id, &endpoint, &identifier)
                    .await?,
            ),
            EngineRequest::GetRateLimits { credential_id } => {
                self.authorize_credential(caller, &credential_id)?;
                EngineResponse::RateLimits(self.limiter().get_config(&credential_id))
            }
            EngineRequest::UpsertRateLimit {
                credential_id,
                endpoint,
                limit,
                period_secs,
                strategy,
            } => {
                self.authorize_admin(caller)?;
                let config = self.limiter().upsert_config_with_strategy(
                    &credential_id,
                    &endpoint,
                    limit,
                    period_secs,
                    strategy,
                )?;
                self.audit_action(
                    caller,
                    AuditAction::RateLimitUpserted,
                    Some(fingerprint(&credential_id).to_string()),
                    Some(format!("endpoint={} limit={}/{}s", endpoint, limit, period_secs)),
                )
                .await;
                EngineResponse::RateLimit(config)
            }
            EngineRequest::RateLimitUsage {
                credential_id,
                endpoint,
            } => {
                self.authorize_credential(caller, &credential_id)?;
                EngineResponse::WindowUsage(
                    self.limiter()
                        .usage_summary(&credential_id, endpoint.as_deref()),
                )
            }

            EngineRequest::RecordUsage {
                credential_id,
                endpoint,
                identifier,
                status,
            } => {
                self.authorize_admin(caller)?;
                EngineResponse::Event(
                    self.ledger()
                        .record(&credential_id, endpoint.as_deref(), &identifier, status)
                        .await?,
                )
            }
            EngineRequest::QueryUsage { filter } => {
                self.authorize_filter(caller, &filter)?;
                EngineResponse::Events(self.query_usage(filter).await?)
            }
            EngineRequest::DeleteUsage { filter } => {
                self.authorize_admin(caller)?;
                let deleted = self.delete_usage(filter).await?;
                self.audit_action(
                    caller,
                    AuditAction::UsageDeleted,
                    None,
                    Some(format!("deleted={}", deleted)),
                )
                .await;
                EngineResponse::Count(deleted)
            }
            EngineRequest::CountUsage { filter } => {
                self.authorize_filter(caller, &filter)?;
                EngineResponse::Count(self.count_usage(filter).await?)
            }
            EngineRequest::SummarizeUsage { group_by, filter } => {
                self.authorize_filter(caller, &filter)?;
                EngineResponse::Groups(self.summarize_usage(group_by, filter).await?)
            }
            EngineRequest::SummarizeCredential {
                credential_id,
                endpoint,
                from,
                to,
            } => {
                self.authorize_credential(caller, &credential_id)?;
                if let (Some(from), Some(to)) = (from, to) {
                    if from > to {
                        return Err(EngineError::invalid("'from' is after 'to'"));
                    }
                }
                EngineResponse::Summary(
                    self.ledger()
                        .summarize_for_credential(&credential_id, endpoint.as_deref(), from, to)
                        .await?,
                )
            }
            EngineRequest::UsageStats { scope } => {
                match &scope {
                    BucketScope::Credential(id) => self.authorize_credential(caller, id)?,
                    BucketScope::User(user_id) => self.authorize_user(caller, user_id)?,
                }
                EngineResponse::Buckets(self.ledger().stats(&scope))
            }

            EngineRequest::DashboardSnapshot { user_id } => {
                self.authorize_user(caller, &user_id)?;
                EngineResponse::Snapshot(self.telemetry().snapshot(&user_id, self.ledger().now()))
            }

            EngineRequest::ExportAudit {
                filter,
                limit,
                offset,
            } => {
                self.authorize_admin(caller)?;
                EngineResponse::AuditEntries(self.audit().query(&filter, limit, offset)?)
            }
            EngineRequest::SummarizeAudit { group_by, filter } => {
                self.authorize_admin(caller)?;
                EngineResponse::Groups(self.audit().summarize(group_by, &filter)?)
            }
        };
        Ok(response)
    }
}
