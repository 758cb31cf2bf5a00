//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub federation: FederationConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public authority (e.g., "wiki.example.com" or "localhost:8080")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://wiki.example.com". This is also the IRI of the
    /// instance actor.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// The wiki's own instance actor
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// preferredUsername of the instance Group
    pub name: String,
    pub summary: String,
    /// RSA modulus size for generated actor keys
    pub key_bits: usize,
}

/// When a follower becomes a member of the followee's followers collection
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FollowerPolicy {
    /// Membership is added when an Accept for the Follow is applied
    #[default]
    Confirmed,
    /// Membership is added as soon as a Follow to a local actor is stored
    Optimistic,
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub follower_policy: FollowerPolicy,
    pub user_agent: String,
    pub request_timeout_seconds: u64,
    /// Allow dereferencing loopback/private hosts (local development and tests)
    pub allow_private_hosts: bool,
    /// Maximum accepted clock skew for the signed Date header
    pub signature_max_skew_seconds: i64,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Task queue tuning
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub timeout_seconds: u64,
    /// How long finished tasks are kept before being purged
    pub retention_seconds: u64,
    pub poll_interval_ms: u64,
    pub purge_interval_seconds: u64,
}

impl QueueConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_seconds)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            backoff_seconds: 5,
            max_backoff_seconds: 300,
            timeout_seconds: 10,
            retention_seconds: 12 * 60 * 60,
            poll_interval_ms: 1000,
            purge_interval_seconds: 600,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (WIKIFED__*)
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost:8080")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/wikifed.db")?
            .set_default("instance.name", "wiki")?
            .set_default("instance.summary", "")?
            .set_default("instance.key_bits", 2048)?
            .set_default("federation.follower_policy", "confirmed")?
            .set_default("federation.user_agent", "wikifed/0.1.0")?
            .set_default("federation.request_timeout_seconds", 10)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("federation.signature_max_skew_seconds", 300)?
            .set_default("queue.workers", 4)?
            .set_default("queue.max_attempts", 5)?
            .set_default("queue.backoff_seconds", 5)?
            .set_default("queue.max_backoff_seconds", 300)?
            .set_default("queue.timeout_seconds", 10)?
            .set_default("queue.retention_seconds", 43200)?
            .set_default("queue.poll_interval_ms", 1000)?
            .set_default("queue.purge_interval_seconds", 600)?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("WIKIFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Config(
                "server.protocol must be http or https".to_string(),
            ));
        }

        if url::Url::parse(&self.server.base_url()).is_err() {
            return Err(AppError::Config(format!(
                "server.domain is not a valid authority: {}",
                self.server.domain
            )));
        }

        if self.queue.workers == 0 {
            return Err(AppError::Config(
                "queue.workers must be greater than 0".to_string(),
            ));
        }

        if self.queue.max_attempts == 0 {
            return Err(AppError::Config(
                "queue.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.queue.timeout_seconds == 0 {
            return Err(AppError::Config(
                "queue.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.instance.key_bits < 1024 {
            return Err(AppError::Config(
                "instance.key_bits must be at least 1024".to_string(),
            ));
        }

        if self.federation.allow_private_hosts {
            tracing::warn!("Dereferencing private and loopback hosts is enabled");
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "wiki.example".to_string(),
                protocol: "https".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/wikifed-test.db"),
            },
            instance: InstanceConfig {
                name: "wiki".to_string(),
                summary: "Test wiki".to_string(),
                key_bits: 1024,
            },
            federation: FederationConfig {
                follower_policy: FollowerPolicy::Confirmed,
                user_agent: "wikifed-test".to_string(),
                request_timeout_seconds: 5,
                allow_private_hosts: true,
                signature_max_skew_seconds: 300,
            },
            queue: QueueConfig::default(),
            logging: LoggingConfig {
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = valid_config();
        config.queue.workers = 0;

        let error = config.validate().expect_err("a pool without workers must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message) if message.contains("queue.workers")
        ));
    }

    #[test]
    fn validate_rejects_unknown_protocol() {
        let mut config = valid_config();
        config.server.protocol = "gopher".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn base_url_keeps_port() {
        let mut config = valid_config();
        config.server.protocol = "http".to_string();
        config.server.domain = "localhost:8080".to_string();
        assert_eq!(config.server.base_url(), "http://localhost:8080");
    }

    #[test]
    fn follower_policy_deserializes_lowercase() {
        let policy: FollowerPolicy = serde_json::from_str("\"optimistic\"").unwrap();
        assert_eq!(policy, FollowerPolicy::Optimistic);
        assert_eq!(FollowerPolicy::default(), FollowerPolicy::Confirmed);
    }
}
