//! Lease backends for the lock coordinator.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use deadpool_redis::Pool;
use tokio::time::Instant;

/// Releases the lease only while `holder` still owns it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out acquiring lock {key}")]
    AcquisitionTimeout { key: String },
    #[error("lease on {key} expired before the locked work finished")]
    LeaseExpired { key: String },
    #[error("lock backend unavailable: {0}")]
    Backend(String),
}

impl From<deadpool_redis::PoolError> for LockError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        LockError::Backend(err.to_string())
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

/// Lease-based mutual exclusion keyed by name.
///
/// A lease self-expires after its TTL; release is compare-and-delete on the
/// holder token.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Returns `true` when the lease was granted to `holder`.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration)
    -> Result<bool, LockError>;

    /// Returns `false` when `holder` no longer owns the lease.
    async fn release(&self, name: &str, holder: &str) -> Result<bool, LockError>;

    /// `local` or `redis`.
    fn mode(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Leases held in process memory. Exclusive only within one instance.
#[derive(Debug, Default)]
pub struct LocalCoordinator {
    leases: DashMap<String, Lease>,
}

impl LocalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationBackend for LocalCoordinator {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let lease = Lease {
            holder: holder.to_string(),
            expires_at: now + ttl,
        };
        match self.leases.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(lease);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        Ok(self
            .leases
            .remove_if(name, |_, lease| lease.holder == holder && lease.expires_at > now)
            .is_some())
    }

    fn mode(&self) -> &'static str {
        "local"
    }
}

/// Leases stored in Redis with `SET NX PX`.
pub struct RedisCoordinator {
    pool: Pool,
    release_script: redis::Script,
}

impl RedisCoordinator {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl CoordinationBackend for RedisCoordinator {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = self
            .release_script
            .key(name)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    fn mode(&self) -> &'static str {
        "redis"
    }
}
