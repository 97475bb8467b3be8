//! Cache-aside decorator over a [`TaskStore`].
//!
//! Reads go to the cache first and fall through to the wrapped store on a
//! miss, populating the cache with the store's answer. Writes go to the store
//! first; only after the write succeeds are the affected keys deleted. The
//! cache is never authoritative: every failure on the cache side is logged and
//! treated as a miss, so the wrapped store alone decides what callers see.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use taskhub_core::Deadline;
use taskhub_storage::{DynTaskStore, NewTask, StorageError, Task, TaskStore, TaskUpdate};

use super::backend::{CacheBackend, bounded};
use crate::metrics;

/// Cache key for a single task.
pub fn task_key(id: i64) -> String {
    format!("task:{id}")
}

/// Cache key for an owner's task list.
pub fn user_key(user_id: i64) -> String {
    format!("user:{user_id}")
}

pub struct CachedTaskStore {
    inner: DynTaskStore,
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl CachedTaskStore {
    pub fn new(inner: DynTaskStore, cache: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    async fn lookup<T: DeserializeOwned>(&self, cx: &Deadline, key: &str) -> Option<T> {
        let bytes = match bounded(cx, self.cache.get(key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache GET failed, reading from store");
                metrics::record_cache_error("get");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable cache entry, reading from store");
                metrics::record_cache_error("decode");
                None
            }
        }
    }

    async fn populate<T: Serialize + ?Sized>(&self, cx: &Deadline, key: &str, value: &T) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to encode cache entry");
                metrics::record_cache_error("encode");
                return;
            }
        };
        if let Err(e) = bounded(cx, self.cache.set(key, bytes, self.ttl)).await {
            tracing::warn!(key = %key, error = %e, "cache SET failed");
            metrics::record_cache_error("set");
        }
    }

    async fn invalidate(&self, cx: &Deadline, keys: &[String]) {
        for key in keys {
            if let Err(e) = bounded(cx, self.cache.delete(key)).await {
                // entry stays stale until its TTL runs out
                tracing::warn!(key = %key, error = %e, "cache invalidation failed");
                metrics::record_cache_error("delete");
            }
        }
    }
}

#[async_trait]
impl TaskStore for CachedTaskStore {
    async fn create_task(&self, cx: &Deadline, task: NewTask) -> Result<Task, StorageError> {
        let created = self.inner.create_task(cx, task).await?;
        self.invalidate(cx, &[user_key(created.user_id)]).await;
        Ok(created)
    }

    async fn list_tasks(&self, cx: &Deadline, user_id: i64) -> Result<Vec<Task>, StorageError> {
        let key = user_key(user_id);
        if let Some(tasks) = self.lookup::<Vec<Task>>(cx, &key).await {
            tracing::debug!(key = %key, "cache hit");
            metrics::record_cache_hit("list");
            return Ok(tasks);
        }
        metrics::record_cache_miss("list");

        let tasks = self.inner.list_tasks(cx, user_id).await?;
        self.populate(cx, &key, tasks.as_slice()).await;
        Ok(tasks)
    }

    async fn get_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<Task, StorageError> {
        let key = task_key(id);
        match self.lookup::<Task>(cx, &key).await {
            Some(task) if task.user_id == user_id => {
                tracing::debug!(key = %key, "cache hit");
                metrics::record_cache_hit("task");
                return Ok(task);
            }
            Some(_) => tracing::debug!(key = %key, "cached task has another owner"),
            None => {}
        }
        metrics::record_cache_miss("task");

        let task = self.inner.get_task(cx, id, user_id).await?;
        self.populate(cx, &key, &task).await;
        Ok(task)
    }

    async fn update_task(&self, cx: &Deadline, update: TaskUpdate) -> Result<Task, StorageError> {
        let updated = self.inner.update_task(cx, update).await?;
        self.invalidate(cx, &[task_key(updated.id), user_key(updated.user_id)])
            .await;
        Ok(updated)
    }

    async fn delete_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<(), StorageError> {
        self.inner.delete_task(cx, id, user_id).await?;
        self.invalidate(cx, &[task_key(id), user_key(user_id)]).await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_bit_exact() {
        assert_eq!(task_key(42), "task:42");
        assert_eq!(user_key(7), "user:7");
    }
}
