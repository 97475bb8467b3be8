pub mod auth;
pub mod cache;
pub mod config;
pub mod handlers;
pub mod lock;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod ratelimit;
pub mod server;
pub mod tasks;
pub mod timeout;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use deadpool_redis::Pool;
use taskhub_db_memory::InMemoryTaskStore;
use taskhub_db_postgres::PostgresTaskStore;
use taskhub_storage::DynTaskStore;

pub use cache::{CacheBackend, CachedTaskStore, LocalCache, RedisCache};
pub use config::{AppConfig, RedisConfig, StorageBackend, StorageConfig};
pub use lock::{CoordinationBackend, LocalCoordinator, LockCoordinator, RedisCoordinator};
pub use observability::init_tracing;
pub use server::{AppState, ServerBuilder, TaskhubServer, build_app};

/// How often the process-local cache drops expired entries.
const LOCAL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The cache and coordination backends shared by every request.
#[derive(Clone)]
pub struct Backends {
    pub cache: Arc<dyn CacheBackend>,
    pub coordination: Arc<dyn CoordinationBackend>,
}

impl Backends {
    /// Process-local backends. Guarantees hold for a single instance only.
    pub fn local() -> Self {
        Self {
            cache: Arc::new(LocalCache::new()),
            coordination: Arc::new(LocalCoordinator::new()),
        }
    }

    /// Both backends over one Redis pool.
    pub fn redis(pool: Pool) -> Self {
        Self {
            cache: Arc::new(RedisCache::new(pool.clone())),
            coordination: Arc::new(RedisCoordinator::new(pool)),
        }
    }
}

/// Create the cache and coordination backends based on configuration.
///
/// If Redis is enabled and reachable, both backends share one pool.
/// Otherwise, falls back to process-local backends.
pub async fn create_backends(config: &RedisConfig) -> Backends {
    if let Some(pool) = connect_redis(config).await {
        return Backends::redis(pool);
    }

    let cache = Arc::new(LocalCache::new());
    cache.spawn_sweeper(LOCAL_SWEEP_INTERVAL);
    Backends {
        cache,
        coordination: Arc::new(LocalCoordinator::new()),
    }
}

/// Build and probe a Redis pool. `None` means run on local backends.
pub async fn connect_redis(config: &RedisConfig) -> Option<Pool> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local cache and locks only");
        return None;
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local backends; \
                 cache and locks are not shared across instances."
            );
            return None;
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("✓ Connected to Redis successfully");
            Some(pool)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local backends; \
                 cache and locks are not shared across instances."
            );
            None
        }
    }
}

/// Create the persistent task store selected by `storage.backend`.
pub async fn create_task_store(config: &StorageConfig) -> anyhow::Result<DynTaskStore> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory task store");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
        StorageBackend::Postgres => {
            let store = PostgresTaskStore::new(&config.postgres)
                .await
                .context("failed to initialize PostgreSQL task store")?;
            Ok(Arc::new(store))
        }
    }
}
