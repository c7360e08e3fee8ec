//! Engine Error Types
//!
//! Every fallible engine operation returns [`EngineResult`]. The variants map
//! one-to-one onto the failure classes callers are expected to distinguish:
//! client errors are surfaced as-is, `Unavailable` is the only retryable class.

use std::time::Duration;

/// Result alias used across the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Error types for engine operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Credential, role, binding or config absent
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate role name or other uniqueness violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller could not be authenticated
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but lacks the required role or ownership
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Credential has been revoked
    #[error("Credential revoked: {0}")]
    Revoked(String),

    /// Credential is past its expiry
    #[error("Credential expired: {0}")]
    Expired(String),

    /// Admission denied by the rate limiter
    #[error("Rate limit exceeded, retry after {}s", retry_after.as_secs_f64())]
    RateLimited { retry_after: Duration },

    /// Storage or downstream dependency unreachable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Malformed filter, config or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Closed classification of [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    Revoked,
    Expired,
    RateLimited,
    Unavailable,
    InvalidInput,
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::Revoked(_) => ErrorKind::Revoked,
            EngineError::Expired(_) => ErrorKind::Expired,
            EngineError::RateLimited { .. } => ErrorKind::RateLimited,
            EngineError::Unavailable(_) => ErrorKind::Unavailable,
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Client errors are the caller's to fix; everything else is ours
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::Unavailable(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }

    /// HTTP-equivalent status for the request/response boundary
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound { .. } => 404,
            EngineError::Conflict(_) => 409,
            EngineError::Unauthorized(_) | EngineError::Revoked(_) | EngineError::Expired(_) => 401,
            EngineError::Forbidden(_) => 403,
            EngineError::RateLimited { .. } => 429,
            EngineError::Unavailable(_) => 503,
            EngineError::InvalidInput(_) => 400,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(EngineError::Unavailable("disk".into()).is_retryable());
        assert!(!EngineError::RateLimited {
            retry_after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!EngineError::not_found("credential", "abc").is_retryable());
    }

    #[test]
    fn test_client_error_classes() {
        assert!(EngineError::invalid("period must be > 0").is_client_error());
        assert!(EngineError::Conflict("role admin".into()).is_client_error());
        assert!(!EngineError::Unavailable("journal".into()).is_client_error());
    }

    #[test]
    fn test_expired_and_revoked_are_distinct() {
        let expired = EngineError::Expired("k".into());
        let revoked = EngineError::Revoked("k".into());
        assert_ne!(expired.kind(), revoked.kind());
        assert_eq!(expired.status_code(), revoked.status_code());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::not_found("role", "x").status_code(), 404);
        assert_eq!(
            EngineError::RateLimited {
                retry_after: Duration::from_secs(3)
            }
            .status_code(),
            429
        );
        assert_eq!(EngineError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(EngineError::invalid("x").status_code(), 400);
    }

    #[test]
    fn test_io_error_maps_to_unavailable() {
        let err: EngineError = std::io::Error::other("broken pipe").into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::not_found("credential", "kg_1234");
        assert_eq!(err.to_string(), "credential not found: kg_1234");
    }
}
