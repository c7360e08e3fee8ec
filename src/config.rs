// Configuration File Support
//
// TOML configuration for the keygate engine with environment variable overrides.
// Configuration files are loaded from the XDG config directory: ~/.config/keygate/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::audit::AuditConfig;
use crate::credentials::CredentialConfig;
use crate::ledger::{AccountingFailurePolicy, LedgerConfig};
use crate::rate_limit::LimiterSettings;
use crate::telemetry::TelemetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// HTTP API configuration
    pub server: ServerConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Credential store configuration
    pub credentials: CredentialConfig,

    /// Rate limiter configuration
    pub rate_limit: LimiterSettings,

    /// Usage ledger configuration
    pub ledger: LedgerConfig,

    /// Live dashboard configuration
    pub telemetry: TelemetryConfig,

    /// Audit trail configuration
    pub audit: AuditConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the engine API
    pub bind: String,

    /// Role required for administrative operations (issuing for other
    /// users, config changes, role management); unset disables the check
    pub admin_role: Option<String>,

    /// Users bound to the admin role at startup
    ///
    /// Their first credential is minted with `keygate issue-credential`.
    pub admin_users: Vec<String>,

    /// Per-request timeout for ledger scans
    pub query_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            admin_role: Some("admin".to_string()),
            admin_users: Vec::new(),
            query_timeout_secs: 30,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve /metrics
    pub enabled: bool,

    /// Port for a dedicated metrics listener; 0 serves /metrics on the API listener
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 0,
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// If the config file does not exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default().apply_env_overrides());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        let config = config.apply_env_overrides();
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/keygate/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "keygate", "Keygate") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("keygate")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - KEYGATE_LOG_LEVEL, KEYGATE_LOG_FORMAT
    /// - KEYGATE_BIND
    /// - KEYGATE_METRICS_ENABLED, KEYGATE_METRICS_PORT
    /// - KEYGATE_CREDENTIAL_JOURNAL, KEYGATE_TOKEN_TTL_SECS
    /// - KEYGATE_RATE_LIMIT_ENABLED, KEYGATE_DEFAULT_POLICY
    /// - KEYGATE_LEDGER_JOURNAL, KEYGATE_RETENTION_SECS, KEYGATE_ACCOUNTING_POLICY
    /// - KEYGATE_AUDIT_JOURNAL
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("KEYGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("KEYGATE_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(bind) = std::env::var("KEYGATE_BIND") {
            self.server.bind = bind;
        }

        if let Ok(enabled) = std::env::var("KEYGATE_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Ok(port) = std::env::var("KEYGATE_METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }

        if let Ok(path) = std::env::var("KEYGATE_CREDENTIAL_JOURNAL") {
            self.credentials.journal_path = Some(path);
        }
        if let Ok(ttl) = std::env::var("KEYGATE_TOKEN_TTL_SECS") {
            if let Ok(ttl) = ttl.parse::<u64>() {
                if ttl > 0 {
                    self.credentials.default_token_ttl_secs = ttl;
                }
            }
        }

        self.rate_limit = self.rate_limit.with_env_overrides();

        if let Ok(path) = std::env::var("KEYGATE_LEDGER_JOURNAL") {
            self.ledger.journal_path = Some(path);
        }
        if let Ok(retention) = std::env::var("KEYGATE_RETENTION_SECS") {
            if let Ok(retention) = retention.parse::<u64>() {
                self.ledger.retention_secs = (retention > 0).then_some(retention);
            }
        }
        if let Ok(policy) = std::env::var("KEYGATE_ACCOUNTING_POLICY") {
            match policy.to_lowercase().as_str() {
                "fail_request" => self.ledger.on_accounting_failure = AccountingFailurePolicy::FailRequest,
                "proceed" => self.ledger.on_accounting_failure = AccountingFailurePolicy::Proceed,
                _ => tracing::warn!("Ignoring unknown KEYGATE_ACCOUNTING_POLICY {:?}", policy),
            }
        }

        if let Ok(path) = std::env::var("KEYGATE_AUDIT_JOURNAL") {
            self.audit.journal_path = Some(path);
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.bind_addr()?;
        if self.server.query_timeout_secs == 0 {
            anyhow::bail!("Query timeout must be > 0");
        }
        if self
            .server
            .admin_role
            .as_deref()
            .is_some_and(|role| role.trim().is_empty())
        {
            anyhow::bail!("Admin role must not be empty when set");
        }
        if self.server.admin_role.is_none() && !self.server.admin_users.is_empty() {
            anyhow::bail!("Admin users require an admin role");
        }

        if self.credentials.default_token_ttl_secs == 0 {
            anyhow::bail!("Default token TTL must be > 0");
        }
        if self.credentials.sweep_interval_secs == 0 {
            anyhow::bail!("Credential sweep interval must be > 0");
        }

        self.rate_limit
            .validate()
            .context("Invalid rate_limit section")?;
        self.ledger.validate().context("Invalid ledger section")?;
        self.telemetry
            .validate()
            .context("Invalid telemetry section")?;

        Ok(())
    }

    /// Parsed API listen address
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
