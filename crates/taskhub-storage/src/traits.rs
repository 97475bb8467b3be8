//! Storage trait for the task storage abstraction layer.

use async_trait::async_trait;
use taskhub_core::Deadline;

use crate::error::StorageError;
use crate::types::{NewTask, Task, TaskUpdate};

/// The contract every task store implements.
///
/// Backends and decorators share this trait so callers cannot tell whether a
/// cache sits in front of the durable store. Every operation receives the
/// request [`Deadline`] and must give up with
/// [`StorageError::DeadlineExceeded`] once it fires.
///
/// # Example
///
/// ```ignore
/// async fn rename(store: &dyn TaskStore, cx: &Deadline, id: i64, owner: i64) -> Result<Task, StorageError> {
///     let task = store.get_task(cx, id, owner).await?;
///     store
///         .update_task(cx, TaskUpdate { id, user_id: owner, title: "renamed".into(), content: task.content, done: task.done })
///         .await
/// }
/// ```
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persists a new task and returns it with id and timestamps assigned.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` on a uniqueness violation.
    async fn create_task(&self, cx: &Deadline, task: NewTask) -> Result<Task, StorageError>;

    /// Lists an owner's tasks ordered by creation time, newest first.
    async fn list_tasks(&self, cx: &Deadline, user_id: i64) -> Result<Vec<Task>, StorageError>;

    /// Reads one task owned by `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the task is absent or owned by
    /// someone else.
    async fn get_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<Task, StorageError>;

    /// Replaces the mutable fields of a task owned by `update.user_id`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no such owned task exists.
    async fn update_task(&self, cx: &Deadline, update: TaskUpdate) -> Result<Task, StorageError>;

    /// Deletes a task owned by `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no such owned task exists.
    async fn delete_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<(), StorageError>;

    /// Returns the name of this store for logging/debugging.
    fn backend_name(&self) -> &'static str;
}
