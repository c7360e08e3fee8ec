//! Usage events and the filters that select them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Group key used for events without an endpoint
pub const NO_ENDPOINT: &str = "(none)";

/// Outcome recorded for a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UsageStatus {
    /// Admitted by the rate limiter
    Admitted,
    /// Denied by the rate limiter
    Denied,
    /// Credential failed validation
    Rejected,
    /// Caller-supplied outcome code
    Custom(String),
}

impl UsageStatus {
    pub fn as_str(&self) -> &str {
        match self {
            UsageStatus::Admitted => "admitted",
            UsageStatus::Denied => "denied",
            UsageStatus::Rejected => "rejected",
            UsageStatus::Custom(code) => code,
        }
    }
}

impl From<String> for UsageStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "admitted" => UsageStatus::Admitted,
            "denied" => UsageStatus::Denied,
            "rejected" => UsageStatus::Rejected,
            _ => UsageStatus::Custom(value),
        }
    }
}

impl From<&str> for UsageStatus {
    fn from(value: &str) -> Self {
        UsageStatus::from(value.to_string())
    }
}

impl From<UsageStatus> for String {
    fn from(status: UsageStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded request; immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    /// Ledger-wide sequence number, strictly increasing in record order
    pub seq: u64,
    pub credential_id: String,
    /// Owner of the credential at record time, if known
    pub owner_id: Option<String>,
    pub endpoint: Option<String>,
    /// Caller or session identifier
    pub identifier: String,
    pub status: UsageStatus,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    /// Position of the event in timestamp order
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.seq)
    }

    pub fn endpoint_key(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(NO_ENDPOINT)
    }
}

/// Event selection; unset fields do not restrict
///
/// The time range is half-open: `from <= timestamp < to`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageFilter {
    pub credential_id: Option<String>,
    pub endpoint: Option<String>,
    pub identifier: Option<String>,
    pub status: Option<UsageStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl UsageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_credential(credential_id: impl Into<String>) -> Self {
        Self {
            credential_id: Some(credential_id.into()),
            ..Self::default()
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn status(mut self, status: UsageStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only events at or after `from`
    pub fn since(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    /// Only events strictly before `to`
    pub fn before(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> EngineResult<()> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(EngineError::invalid("filter 'from' is after 'to'"));
            }
        }
        Ok(())
    }

    pub fn matches(&self, event: &UsageEvent) -> bool {
        self.credential_id
            .as_deref()
            .is_none_or(|id| event.credential_id == id)
            && self
                .endpoint
                .as_deref()
                .is_none_or(|endpoint| event.endpoint.as_deref() == Some(endpoint))
            && self
                .identifier
                .as_deref()
                .is_none_or(|identifier| event.identifier == identifier)
            && self.status.as_ref().is_none_or(|status| event.status == *status)
            && self.from.is_none_or(|from| event.timestamp >= from)
            && self.to.is_none_or(|to| event.timestamp < to)
    }
}

/// Dimension for `summarize`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    #[default]
    Endpoint,
    Identifier,
    Status,
}

impl GroupBy {
    pub fn key(&self, event: &UsageEvent) -> String {
        match self {
            GroupBy::Endpoint => event.endpoint_key().to_string(),
            GroupBy::Identifier => event.identifier.clone(),
            GroupBy::Status => event.status.as_str().to_string(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "endpoint" => Some(GroupBy::Endpoint),
            "identifier" => Some(GroupBy::Identifier),
            "status" => Some(GroupBy::Status),
            _ => None,
        }
    }
}

/// Per-credential outcome totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total: u64,
    pub admitted: u64,
    pub denied: u64,
}
