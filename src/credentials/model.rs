//! Credential records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two concrete credential kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Long-lived API key, may not expire
    ApiKey,
    /// Short-lived auth token, always carries an expiry
    AuthToken,
}

impl CredentialKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            CredentialKind::ApiKey => "kg_",
            CredentialKind::AuthToken => "kgt_",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::ApiKey => "api_key",
            CredentialKind::AuthToken => "auth_token",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Revoked,
}

/// An API key or auth token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Opaque key string
    pub id: String,
    pub owner_id: String,
    pub kind: CredentialKind,
    pub status: CredentialStatus,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful admission; best-effort, not journaled
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }
}

/// Journal record for a credential mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CredentialEvent {
    Issued { credential: Credential },
    Revoked { id: String, at: DateTime<Utc> },
    Reactivated { id: String, at: DateTime<Utc> },
    Removed { id: String, at: DateTime<Utc> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential(expires_at: Option<DateTime<Utc>>) -> Credential {
        Credential {
            id: "kg_test".to_string(),
            owner_id: "user-1".to_string(),
            kind: CredentialKind::ApiKey,
            status: CredentialStatus::Active,
            issued_at: DateTime::from_timestamp(1_000, 0).unwrap(),
            expires_at,
            last_used_at: None,
        }
    }

    #[test]
    fn test_non_expiring_never_expires() {
        let cred = credential(None);
        assert!(!cred.is_expired_at(DateTime::from_timestamp(i32::MAX as i64, 0).unwrap()));
    }

    #[test]
    fn test_expiry_is_strictly_after() {
        let expires = DateTime::from_timestamp(2_000, 0).unwrap();
        let cred = credential(Some(expires));
        assert!(!cred.is_expired_at(expires));
        assert!(cred.is_expired_at(expires + Duration::seconds(1)));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = CredentialEvent::Revoked {
            id: "kg_1".to_string(),
            at: DateTime::from_timestamp(5, 0).unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "revoked");
        assert_eq!(json["id"], "kg_1");
    }
}
