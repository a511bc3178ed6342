//! Configuration loader: file discovery plus environment overrides.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "bulkcast.toml",
    "./config/bulkcast.toml",
    "/etc/bulkcast/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load from file (if one is found), apply env overrides, validate.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("BULKCAST_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    // HTTP
    if let Ok(val) = env::var("BULKCAST_HTTP_HOST") {
        config.http.host = val;
    }
    if let Ok(val) = env::var("BULKCAST_HTTP_PORT") {
        if let Ok(port) = val.parse() {
            config.http.port = port;
        }
    }

    // Database
    if let Ok(val) = env::var("BULKCAST_DATABASE_URL") {
        config.database.url = val;
    }
    if let Ok(val) = env::var("BULKCAST_DATABASE_MAX_CONNECTIONS") {
        if let Ok(n) = val.parse() {
            config.database.max_connections = n;
        }
    }

    // Provider
    if let Ok(val) = env::var("BULKCAST_PROVIDER_API_BASE_URL") {
        config.provider.api_base_url = val;
    }
    if let Ok(val) = env::var("BULKCAST_PROVIDER_ACCESS_TOKEN") {
        config.provider.access_token = val;
    }
    if let Ok(val) = env::var("BULKCAST_PROVIDER_CALL_TIMEOUT_SECONDS") {
        if let Ok(secs) = val.parse() {
            config.provider.call_timeout_seconds = secs;
        }
    }

    // Dispatch
    if let Ok(val) = env::var("BULKCAST_WORKER_POOL_SIZE") {
        if let Ok(n) = val.parse() {
            config.dispatch.worker_pool_size = n;
        }
    }
    if let Ok(val) = env::var("BULKCAST_MAX_ATTEMPTS") {
        if let Ok(n) = val.parse() {
            config.dispatch.max_attempts = n;
        }
    }
    if let Ok(val) = env::var("BULKCAST_QUEUE_POLL_INTERVAL_SECONDS") {
        if let Ok(secs) = val.parse() {
            config.dispatch.queue_poll_interval_seconds = secs;
        }
    }
    if let Ok(val) = env::var("BULKCAST_RETRY_BACKOFF_SECONDS") {
        if let Ok(secs) = val.parse() {
            config.dispatch.retry_backoff_seconds = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[dispatch]\nworker_pool_size = 2\n[http]\nport = 9999"
        )
        .unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.dispatch.worker_pool_size, 2);
        assert_eq!(config.http.port, 9999);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ConfigLoader::with_path("/nonexistent/bulkcast.toml")
            .load()
            .unwrap();
        assert_eq!(config.dispatch.worker_pool_size, 10);
    }
}
