//! Rate Limit Configuration
//!
//! Per-(credential, endpoint) limit records and the limiter-wide settings,
//! including the policy applied when no record matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Endpoint name of a credential-wide config that applies to every endpoint
/// without a config of its own
pub const WILDCARD_ENDPOINT: &str = "*";

/// Default limit for the `limited` fallback policy
pub const DEFAULT_LIMIT: u32 = 100; // requests per period
pub const DEFAULT_PERIOD_SECS: u64 = 60;

/// Counting scheme for a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStrategy {
    /// floor(now / period) * period windows; up to 2x limit across a boundary
    #[default]
    Fixed,
    /// Fixed windows weighted by the previous window's count
    Sliding,
}

/// Rate limit for one (credential, endpoint) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub credential_id: String,
    pub endpoint: String,
    /// Maximum admitted requests per window
    pub limit: u32,
    pub period_secs: u64,
    #[serde(default)]
    pub strategy: WindowStrategy,
    pub updated_at: DateTime<Utc>,
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn is_wildcard(&self) -> bool {
        self.endpoint == WILDCARD_ENDPOINT
    }
}

/// Check a limit/period pair supplied by a caller
pub fn validate_limit(limit: u32, period_secs: u64) -> EngineResult<()> {
    if limit == 0 {
        return Err(EngineError::invalid("limit must be positive"));
    }
    if period_secs == 0 {
        return Err(EngineError::invalid("period must be positive"));
    }
    if period_secs > i64::MAX as u64 / 1000 {
        return Err(EngineError::invalid("period out of range"));
    }
    Ok(())
}

/// What to do for a (credential, endpoint) pair with no config
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DefaultPolicy {
    /// Admit without counting
    #[default]
    AllowAll,
    /// Deny every request
    DenyAll,
    /// Apply this limit per endpoint
    Limited { limit: u32, period_secs: u64 },
}

impl DefaultPolicy {
    /// Parse `allow_all`, `deny_all` or `<limit>/<period_secs>`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "allow_all" | "allow" => Some(DefaultPolicy::AllowAll),
            "deny_all" | "deny" => Some(DefaultPolicy::DenyAll),
            other => {
                let (limit, period) = other.split_once('/')?;
                let limit = limit.trim().parse().ok()?;
                let period_secs = period.trim().parse().ok()?;
                validate_limit(limit, period_secs).ok()?;
                Some(DefaultPolicy::Limited { limit, period_secs })
            }
        }
    }
}

/// Limiter-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Enable rate limiting; when off every valid credential is admitted
    pub enabled: bool,

    /// Interval between idle-counter prunes
    pub prune_interval_secs: u64,

    /// Policy for pairs without a config
    pub default_policy: DefaultPolicy,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prune_interval_secs: 300,
            default_policy: DefaultPolicy::default(),
        }
    }
}

impl LimiterSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `KEYGATE_RATE_LIMIT_ENABLED` and `KEYGATE_DEFAULT_POLICY`
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("KEYGATE_RATE_LIMIT_ENABLED") {
            self.enabled = val.parse().unwrap_or(self.enabled);
        }
        if let Ok(val) = std::env::var("KEYGATE_DEFAULT_POLICY") {
            if let Some(policy) = DefaultPolicy::parse(&val) {
                self.default_policy = policy;
            }
        }
        self
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if let DefaultPolicy::Limited { limit, period_secs } = self.default_policy {
            validate_limit(limit, period_secs)?;
        }
        if self.prune_interval_secs == 0 {
            return Err(EngineError::invalid("prune interval must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = LimiterSettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.default_policy, DefaultPolicy::AllowAll);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_disabled_settings() {
        assert!(!LimiterSettings::disabled().enabled);
    }

    #[test]
    fn test_validate_limit() {
        assert!(validate_limit(3, 60).is_ok());
        assert!(validate_limit(0, 60).is_err());
        assert!(validate_limit(3, 0).is_err());
        assert!(validate_limit(3, u64::MAX).is_err());
    }

    #[test]
    fn test_parse_default_policy() {
        assert_eq!(DefaultPolicy::parse("allow_all"), Some(DefaultPolicy::AllowAll));
        assert_eq!(DefaultPolicy::parse("DENY_ALL"), Some(DefaultPolicy::DenyAll));
        assert_eq!(
            DefaultPolicy::parse("100/60"),
            Some(DefaultPolicy::Limited {
                limit: 100,
                period_secs: 60
            })
        );
        assert_eq!(DefaultPolicy::parse("0/60"), None);
        assert_eq!(DefaultPolicy::parse("sometimes"), None);
    }

    #[test]
    fn test_policy_serialization() {
        let settings = LimiterSettings {
            default_policy: DefaultPolicy::Limited {
                limit: DEFAULT_LIMIT,
                period_secs: DEFAULT_PERIOD_SECS,
            },
            ..LimiterSettings::default()
        };
        let toml = toml::to_string(&settings).unwrap();
        let parsed: LimiterSettings = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, settings);
    }
}
