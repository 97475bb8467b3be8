use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskhub_db_postgres::PostgresConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Redis backs both the shared cache and lock coordination
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.request_timeout_ms == 0 {
            return Err("server.request_timeout_ms must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        // Storage validations
        if self.storage.backend == StorageBackend::Postgres {
            self.storage.postgres.validate()?;
        }
        // Redis validations
        if self.redis.enabled {
            if self.redis.url.trim().is_empty() {
                return Err("redis.url is required when redis.enabled = true".into());
            }
            if self.redis.pool_size == 0 || self.redis.timeout_ms == 0 {
                return Err("redis.pool_size and redis.timeout_ms must be > 0".into());
            }
        }
        if self.cache.task_ttl_secs == 0 {
            return Err("cache.task_ttl_secs must be > 0".into());
        }
        // Rate limit validations
        if self.rate_limit.max_requests == 0 {
            return Err("rate_limit.max_requests must be > 0".into());
        }
        if self.rate_limit.window_secs == 0 {
            return Err("rate_limit.window_secs must be > 0".into());
        }
        // Lock validations
        if self.lock.acquire_timeout_ms == 0 || self.lock.retry_interval_ms == 0 {
            return Err("lock timeouts must be > 0".into());
        }
        if self.lock.lease_ttl_ms <= self.lock.retry_interval_ms {
            return Err("lock.lease_ttl_ms must exceed lock.retry_interval_ms".into());
        }
        // a write must not outlive the lease guarding it
        if self.lock.lease_ttl_ms < self.server.request_timeout_ms {
            return Err("lock.lease_ttl_ms must be >= server.request_timeout_ms".into());
        }
        if self.auth.jwt_secret.trim().is_empty() {
            return Err("auth.jwt_secret must be set".into());
        }
        // Logging level basic validation
        let lvl = self.logging.level.to_ascii_lowercase();
        match lvl.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err("logging.level must be one of error|warn|info|debug|trace".into()),
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let host = self.server.host.as_str();
        let port = self.server.port;
        format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-request deadline applied by the timeout guard
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Prefer the first `X-Forwarded-For` hop as client identity.
    /// Only enable behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_ms: default_request_timeout_ms(),
            body_limit_bytes: default_body_limit(),
            trust_forwarded_for: false,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

/// Redis configuration for the shared cache and lock coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades to process-local backends without it)
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for cached tasks and task lists
    #[serde(default = "default_task_ttl_secs")]
    pub task_ttl_secs: u64,
}

fn default_task_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            task_ttl_secs: default_task_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests admitted per client per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_requests() -> u32 {
    100
}
fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease lifetime; a crashed holder's lease expires after this
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_lease_ttl_ms() -> u64 {
    10_000
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_retry_interval_ms() -> u64 {
    50
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// HS256 secret used to verify bearer tokens
    #[serde(default)]
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("taskhub.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., TASKHUB__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("TASKHUB")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.auth.jwt_secret = "secret".into();
        cfg
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.request_timeout_ms, 10_000);
        assert_eq!(cfg.cache.task_ttl_secs, 3600);
        assert_eq!(cfg.rate_limit.max_requests, 100);
        assert_eq!(cfg.rate_limit.window_secs, 60);
        assert_eq!(cfg.lock.lease_ttl_ms, 10_000);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert!(!cfg.redis.enabled);
    }

    #[test]
    fn default_with_secret_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn missing_secret_is_rejected() {
        let err = AppConfig::default().validate().unwrap_err();
        assert!(err.contains("jwt_secret"));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = valid();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.rate_limit.window_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.lock.lease_ttl_ms = 50;
        cfg.lock.retry_interval_ms = 50;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.lock.lease_ttl_ms = 1_000;
        cfg.server.request_timeout_ms = 2_000;
        assert!(cfg.validate().is_err());
        cfg.lock.lease_ttl_ms = 2_000;
        assert!(cfg.validate().is_ok());

        let mut cfg = valid();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.storage.backend = StorageBackend::Postgres;
        cfg.storage.postgres.url = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_toml_sections() {
        let toml = r#"
            [server]
            port = 9090
            trust_forwarded_for = true

            [storage]
            backend = "postgres"

            [storage.postgres]
            url = "postgres://u:p@db/tasks"

            [rate_limit]
            max_requests = 5

            [auth]
            jwt_secret = "s3cret"
        "#;
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert!(cfg.server.trust_forwarded_for);
        assert_eq!(cfg.storage.backend, StorageBackend::Postgres);
        assert_eq!(cfg.storage.postgres.url, "postgres://u:p@db/tasks");
        assert_eq!(cfg.storage.postgres.pool_size, 10);
        assert_eq!(cfg.rate_limit.max_requests, 5);
        assert_eq!(cfg.rate_limit.window_secs, 60);
        assert!(cfg.validate().is_ok());
    }
}
