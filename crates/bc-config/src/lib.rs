//! Bulkcast configuration.
//!
//! TOML file with environment variable overrides (`BULKCAST_*`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub dispatch: DispatchConfig,
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject configurations the dispatch engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.worker_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.provider.call_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "provider.call_timeout_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// SQLite database configuration. Queue and store share the same database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/bulkcast.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

/// Outbound message provider (WhatsApp Cloud API) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Graph API base, without trailing slash
    pub api_base_url: String,
    pub access_token: String,
    /// Per-call request timeout
    pub call_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://graph.facebook.com/v22.0".to_string(),
            access_token: String::new(),
            call_timeout_seconds: 20,
            connect_timeout_seconds: 10,
        }
    }
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of concurrent workers
    pub worker_pool_size: u32,
    /// Maximum send attempts per recipient (>= 1)
    pub max_attempts: u32,
    /// Sleep between dequeue polls when the queue is empty
    pub queue_poll_interval_seconds: u64,
    /// Base delay before a retry re-enters the queue; doubles per attempt
    pub retry_backoff_seconds: u64,
    /// Upper bound on the retry delay
    pub retry_backoff_cap_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            max_attempts: 3,
            queue_poll_interval_seconds: 1,
            retry_backoff_seconds: 5,
            retry_backoff_cap_seconds: 300,
        }
    }
}

/// Static bearer-token auth: token -> user id.
///
/// Credential issuance lives with the identity collaborator; the service
/// only needs to resolve an already-issued token to a user id.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = AppConfig::default();
        assert_eq!(config.dispatch.worker_pool_size, 10);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.queue_poll_interval_seconds, 1);
        assert_eq!(config.provider.call_timeout_seconds, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_attempts() {
        let mut config = AppConfig::default();
        config.dispatch.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_empty_pool() {
        let mut config = AppConfig::default();
        config.dispatch.worker_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let toml_str = r#"
            [dispatch]
            worker_pool_size = 4
            max_attempts = 5

            [provider]
            access_token = "secret"

            [auth.tokens]
            "tok-1" = "user-1"
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dispatch.worker_pool_size, 4);
        assert_eq!(config.dispatch.max_attempts, 5);
        // untouched sections keep defaults
        assert_eq!(config.dispatch.queue_poll_interval_seconds, 1);
        assert_eq!(config.provider.access_token, "secret");
        assert_eq!(config.auth.tokens.get("tok-1").unwrap(), "user-1");
    }
}
