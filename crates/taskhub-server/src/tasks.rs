//! Task operations as seen by the HTTP layer.
//!
//! Input validation happens here. Mutations of an existing task run under
//! the task's distributed lock, so the store write and the cache
//! invalidation that follows it complete before another instance may touch
//! the same id.

use serde::{Deserialize, Serialize};
use taskhub_api::ApiError;
use taskhub_core::{Deadline, DeadlineExceeded};
use taskhub_storage::{DynTaskStore, ErrorCategory, NewTask, StorageError, Task, TaskUpdate};

use crate::lock::{LockCoordinator, LockError};

pub const MAX_TITLE_CHARS: usize = 255;

/// Request body for create and full-replacement update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl From<DeadlineExceeded> for TaskError {
    fn from(err: DeadlineExceeded) -> Self {
        TaskError::Storage(err.into())
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Validation(msg) => ApiError::bad_request(msg),
            TaskError::Storage(e) => storage_error_to_api(e),
            TaskError::Lock(e) => ApiError::service_unavailable(e.to_string()),
        }
    }
}

fn storage_error_to_api(err: StorageError) -> ApiError {
    match err.category() {
        ErrorCategory::NotFound => ApiError::not_found(err.to_string()),
        ErrorCategory::Conflict => ApiError::conflict(err.to_string()),
        ErrorCategory::Timeout => ApiError::gateway_timeout(err.to_string()),
        ErrorCategory::Infrastructure | ErrorCategory::Internal => {
            ApiError::internal(err.to_string())
        }
    }
}

fn validate(input: &TaskInput) -> Result<(), TaskError> {
    let title = input.title.trim();
    if title.is_empty() {
        return Err(TaskError::Validation("title is required".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(TaskError::Validation(format!(
            "title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(())
}

pub struct TaskService {
    store: DynTaskStore,
    locks: LockCoordinator,
}

impl TaskService {
    /// `store` is expected to be the cache-decorated store.
    pub fn new(store: DynTaskStore, locks: LockCoordinator) -> Self {
        Self { store, locks }
    }

    pub fn store(&self) -> &DynTaskStore {
        &self.store
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub async fn create(
        &self,
        cx: &Deadline,
        user_id: i64,
        input: TaskInput,
    ) -> Result<Task, TaskError> {
        validate(&input)?;
        let task = NewTask::new(user_id, input.title)
            .with_content(input.content)
            .with_done(input.done);
        Ok(self.store.create_task(cx, task).await?)
    }

    pub async fn list(&self, cx: &Deadline, user_id: i64) -> Result<Vec<Task>, TaskError> {
        Ok(self.store.list_tasks(cx, user_id).await?)
    }

    pub async fn get(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<Task, TaskError> {
        Ok(self.store.get_task(cx, id, user_id).await?)
    }

    pub async fn update(
        &self,
        cx: &Deadline,
        id: i64,
        user_id: i64,
        input: TaskInput,
    ) -> Result<Task, TaskError> {
        validate(&input)?;
        let update = TaskUpdate {
            id,
            user_id,
            title: input.title,
            content: input.content,
            done: input.done,
        };
        self.locks
            .with_lock(id, cx, |held| async move {
                Ok::<_, TaskError>(self.store.update_task(&held, update).await?)
            })
            .await
    }

    pub async fn delete(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<(), TaskError> {
        self.locks
            .with_lock(id, cx, |held| async move {
                Ok::<_, TaskError>(self.store.delete_task(&held, id, user_id).await?)
            })
            .await
    }
}
