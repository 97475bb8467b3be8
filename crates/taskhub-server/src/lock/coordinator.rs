use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use taskhub_core::{Deadline, DeadlineExceeded};
use tokio::time::Instant;
use uuid::Uuid;

use super::backend::{CoordinationBackend, LockError};
use crate::config::LockConfig;
use crate::metrics;

/// Lock name for a task id.
pub fn lock_key(task_id: i64) -> String {
    format!("lock:task:{task_id}")
}

/// Serializes mutations of the same task across all instances.
#[derive(Clone)]
pub struct LockCoordinator {
    backend: Arc<dyn CoordinationBackend>,
    lease_ttl: Duration,
    acquire_timeout: Duration,
    retry_interval: Duration,
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn CoordinationBackend>, config: &LockConfig) -> Self {
        Self {
            backend,
            lease_ttl: Duration::from_millis(config.lease_ttl_ms),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
        }
    }

    pub fn mode(&self) -> &'static str {
        self.backend.mode()
    }

    /// Polls the backend until the lease is granted.
    ///
    /// Gives up with [`LockError::AcquisitionTimeout`] at the earlier of the
    /// request deadline and the acquire timeout. Backend errors end the
    /// attempt immediately.
    pub async fn acquire(&self, task_id: i64, cx: &Deadline) -> Result<LeaseGuard, LockError> {
        let key = lock_key(task_id);
        let holder = Uuid::new_v4().to_string();
        let wait = cx.narrowed(self.acquire_timeout);

        loop {
            // the lease can only have started after this point
            let attempted_at = Instant::now();
            let granted = match wait
                .run(self.backend.try_acquire(&key, &holder, self.lease_ttl))
                .await
            {
                Ok(granted) => granted?,
                Err(_) => break,
            };
            if granted {
                tracing::debug!(key = %key, "lock acquired");
                metrics::record_lock_acquired();
                return Ok(LeaseGuard {
                    backend: Arc::clone(&self.backend),
                    key,
                    holder,
                    release_timeout: self.lease_ttl,
                    expires_at: attempted_at + self.lease_ttl,
                    released: false,
                });
            }
            if wait.run(tokio::time::sleep(self.retry_interval)).await.is_err() {
                break;
            }
        }

        tracing::warn!(key = %key, "timed out waiting for lock");
        metrics::record_lock_timeout();
        Err(LockError::AcquisitionTimeout { key })
    }

    /// Runs `f` while holding the lease for `task_id`.
    ///
    /// `f` receives the request deadline narrowed to the lease expiry and is
    /// dropped if it is still running when the lease runs out, so no write
    /// can land after another holder has taken over. The lease is released
    /// after `f` completes, whatever its outcome. If the returned future is
    /// dropped midway, the guard releases it in the background.
    pub async fn with_lock<T, E, F, Fut>(&self, task_id: i64, cx: &Deadline, f: F) -> Result<T, E>
    where
        F: FnOnce(Deadline) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError> + From<DeadlineExceeded>,
    {
        let lease = self.acquire(task_id, cx).await?;
        let held = cx.narrowed(lease.expires_at().saturating_duration_since(Instant::now()));

        let result = match held.run(f(held.clone())).await {
            Ok(result) => result,
            Err(DeadlineExceeded) if cx.is_expired() => Err(DeadlineExceeded.into()),
            Err(DeadlineExceeded) => {
                tracing::warn!(key = %lease.key(), "lease expired before locked work finished");
                metrics::record_lock_timeout();
                Err(LockError::LeaseExpired {
                    key: lease.key().to_string(),
                }
                .into())
            }
        };
        lease.release().await;
        result
    }
}

/// A held lease. Released explicitly with [`LeaseGuard::release`] or on drop.
pub struct LeaseGuard {
    backend: Arc<dyn CoordinationBackend>,
    key: String,
    holder: String,
    release_timeout: Duration,
    expires_at: Instant,
    released: bool,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Earliest instant the backend may hand the lease to someone else.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Best-effort release; failures are logged and the lease left to expire.
    pub async fn release(mut self) {
        self.released = true;
        release_lease(
            self.backend.as_ref(),
            &self.key,
            &self.holder,
            self.release_timeout,
        )
        .await;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "no runtime to release lock, lease left to expire");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        let timeout = self.release_timeout;
        handle.spawn(async move {
            release_lease(backend.as_ref(), &key, &holder, timeout).await;
        });
    }
}

// Not bound by the request deadline: a cancelled request must still give the
// lease back. Past the lease TTL there is nothing left to release.
async fn release_lease(
    backend: &dyn CoordinationBackend,
    key: &str,
    holder: &str,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, backend.release(key, holder)).await {
        Ok(Ok(true)) => tracing::debug!(key = %key, "lock released"),
        Ok(Ok(false)) => tracing::warn!(key = %key, "lease expired before release"),
        Ok(Err(e)) => tracing::warn!(key = %key, error = %e, "failed to release lock"),
        Err(_) => tracing::warn!(key = %key, "lock release timed out"),
    }
}
