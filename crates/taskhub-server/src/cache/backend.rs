//! Cache backends: process-local (DashMap) and shared (Redis).

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use taskhub_core::{Deadline, DeadlineExceeded};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),
    #[error("cache command error: {0}")]
    Command(String),
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        CacheError::Connection(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Command(err.to_string())
    }
}

/// Key-value store shared by the task cache and the rate limiter.
///
/// `increment` on an absent key starts from zero, and a key's expiry is
/// only ever set by `set` or `expire`, never by `increment`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn increment(&self, key: &str) -> Result<i64, CacheError>;

    /// Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Time left before `key` expires; `None` when it is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Round-trip to the backend, for readiness checks.
    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    /// `local` or `redis`.
    fn mode(&self) -> &'static str;
}

/// Runs a cache call under the request deadline.
pub async fn bounded<T, F>(cx: &Deadline, fut: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    cx.run(fut).await?
}

/// A cached entry with TTL support.
#[derive(Clone, Debug)]
struct CachedEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CachedEntry {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Single-instance backend over a DashMap.
///
/// Expired entries are dropped lazily on access and by [`LocalCache::purge_expired`].
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: DashMap<String, CachedEntry>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live and not-yet-purged entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purges expired entries until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "expired local cache entries purged");
                }
            }
        });
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.data.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), CachedEntry::new(value, Some(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        tracing::debug!(key = %key, "cache invalidated (local)");
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CachedEntry::new(b"0".to_vec(), None));
        if entry.is_expired(now) {
            *entry = CachedEntry::new(b"0".to_vec(), None);
        }
        let current: i64 = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CacheError::Command(format!("value at {key} is not an integer")))?;
        let next = current + 1;
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    fn mode(&self) -> &'static str {
        "local"
    }
}

/// Multi-instance backend over a deadpool-redis pool.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        tracing::trace!(key = %key, hit = value.is_some(), "redis GET");
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        // SETEX rejects a zero TTL
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        tracing::debug!(key = %key, ttl_secs, "cache set (redis)");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(key).await?;
        tracing::debug!(key = %key, "cache invalidated (redis)");
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.pool.get().await?;
        let count: i64 = conn.incr(key, 1).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.pool.get().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let applied: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(applied)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.pool.get().await?;
        // -2 for a missing key, -1 for one without expiry
        let ttl_ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(ttl_ms).ok().map(Duration::from_millis))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn mode(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn local_get_set_and_expiry() {
        let cache = LocalCache::new();
        cache
            .set("task:1", b"value".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("task:1").await.unwrap(), Some(b"value".to_vec()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("task:1").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn local_delete_absent_key_is_noop() {
        let cache = LocalCache::new();
        cache.delete("user:9").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn local_increment_keeps_expiry_fixed() {
        let cache = LocalCache::new();
        assert_eq!(cache.increment("rate_limit:a").await.unwrap(), 1);
        assert!(
            cache
                .expire("rate_limit:a", Duration::from_secs(10))
                .await
                .unwrap()
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.increment("rate_limit:a").await.unwrap(), 2);

        // the second increment did not push the window out
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.increment("rate_limit:a").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_ttl_reports_remaining_time() {
        let cache = LocalCache::new();
        assert_eq!(cache.ttl("rate_limit:a").await.unwrap(), None);

        cache.increment("rate_limit:a").await.unwrap();
        assert_eq!(cache.ttl("rate_limit:a").await.unwrap(), None);

        cache
            .expire("rate_limit:a", Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            cache.ttl("rate_limit:a").await.unwrap(),
            Some(Duration::from_secs(6))
        );
    }

    #[tokio::test]
    async fn local_expire_on_missing_key_reports_false() {
        let cache = LocalCache::new();
        assert!(!cache.expire("nope", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn local_increment_rejects_non_integer() {
        let cache = LocalCache::new();
        cache
            .set("task:1", b"{}".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            cache.increment("task:1").await,
            Err(CacheError::Command(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_entries() {
        let cache = LocalCache::new();
        cache.set("a", vec![1], Duration::from_secs(1)).await.unwrap();
        cache.set("b", vec![2], Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn bounded_fails_on_expired_deadline() {
        let cache = LocalCache::new();
        let cx = Deadline::after(Duration::ZERO);
        let err = bounded(&cx, cache.get("task:1")).await.unwrap_err();
        assert!(matches!(err, CacheError::Deadline(_)));
    }
}
