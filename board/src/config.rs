//! Configuration for the board.
//!
//! Loads configuration from environment variables with sensible defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Backend environment the board talks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendEnv {
    /// Test sheet
    #[default]
    Test,
    /// Production sheet
    Prod,
}

impl BackendEnv {
    /// Name used in query parameters and environment variables.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }

    /// Parse `test` or `prod` (case-insensitive).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "test" => Some(Self::Test),
            "prod" | "production" => Some(Self::Prod),
            _ => None,
        }
    }
}

impl fmt::Display for BackendEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable held a value that could not be parsed
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
    },
    /// A setting must be greater than zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// Production needs an explicit backend URL
    #[error("No backend URL configured for the {0} environment")]
    MissingBackendUrl(BackendEnv),
}

/// Board configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Selected backend environment (`PACKBOARD_ENV`)
    pub env: BackendEnv,
    /// Base URL of the test backend
    pub test_url: Option<String>,
    /// Base URL of the production backend
    pub prod_url: Option<String>,
    /// Per-attempt update timeout in milliseconds (default: 60000)
    pub update_timeout_ms: u64,
    /// Retries after the first update attempt (default: 2)
    pub update_max_retries: usize,
    /// Backoff base in milliseconds (default: 1000)
    pub update_retry_base_ms: u64,
    /// Lifetime of pending request ids in seconds (default: 300)
    pub idempotency_ttl_secs: u64,
    /// Cards per column page (default: 10)
    pub page_size: u32,
    /// Query timeout in milliseconds (default: 30000)
    pub query_timeout_ms: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            env: BackendEnv::Test,
            test_url: None,
            prod_url: None,
            update_timeout_ms: 60_000,
            update_max_retries: 2,
            update_retry_base_ms: 1_000,
            idempotency_ttl_secs: 300,
            page_size: 10,
            query_timeout_ms: 30_000,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        _ => Ok(default),
    }
}

impl BoardConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let env = match non_empty("PACKBOARD_ENV") {
            Some(value) => BackendEnv::parse(&value).ok_or(ConfigError::InvalidValue {
                name: "PACKBOARD_ENV",
                value,
            })?,
            None => defaults.env,
        };

        Ok(Self {
            env,
            test_url: non_empty("PACKBOARD_BACKEND_URL_TEST").or_else(|| non_empty("PACKBOARD_BACKEND_URL")),
            prod_url: non_empty("PACKBOARD_BACKEND_URL_PROD"),
            update_timeout_ms: parse_var(&lookup, "PACKBOARD_UPDATE_TIMEOUT_MS", defaults.update_timeout_ms)?,
            update_max_retries: parse_var(&lookup, "PACKBOARD_UPDATE_MAX_RETRIES", defaults.update_max_retries)?,
            update_retry_base_ms: parse_var(&lookup, "PACKBOARD_UPDATE_RETRY_BASE_MS", defaults.update_retry_base_ms)?,
            idempotency_ttl_secs: parse_var(&lookup, "PACKBOARD_IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl_secs)?,
            page_size: parse_var(&lookup, "PACKBOARD_PAGE_SIZE", defaults.page_size)?,
            query_timeout_ms: parse_var(&lookup, "PACKBOARD_QUERY_TIMEOUT_MS", defaults.query_timeout_ms)?,
        })
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] for a zero page size or timeout, and
    /// [`ConfigError::MissingBackendUrl`] for production without a URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Zero("PACKBOARD_PAGE_SIZE"));
        }
        if self.update_timeout_ms == 0 {
            return Err(ConfigError::Zero("PACKBOARD_UPDATE_TIMEOUT_MS"));
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::Zero("PACKBOARD_QUERY_TIMEOUT_MS"));
        }
        if self.idempotency_ttl_secs == 0 {
            return Err(ConfigError::Zero("PACKBOARD_IDEMPOTENCY_TTL_SECS"));
        }
        if self.env == BackendEnv::Prod && self.prod_url.is_none() {
            return Err(ConfigError::MissingBackendUrl(BackendEnv::Prod));
        }
        Ok(())
    }

    /// Base URL of the selected environment, if configured.
    #[must_use]
    pub fn backend_url(&self) -> Option<&str> {
        match self.env {
            BackendEnv::Test => self.test_url.as_deref(),
            BackendEnv::Prod => self.prod_url.as_deref(),
        }
    }

    /// Per-attempt update timeout.
    #[must_use]
    pub const fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }

    /// Backoff base.
    #[must_use]
    pub const fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.update_retry_base_ms)
    }

    /// Query timeout.
    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Idempotency TTL.
    #[must_use]
    pub fn idempotency_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.idempotency_ttl_secs).unwrap_or(i64::MAX))
    }
}
