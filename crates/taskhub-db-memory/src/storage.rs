use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use taskhub_core::Deadline;
use taskhub_storage::{NewTask, StorageError, Task, TaskStore, TaskUpdate};

/// In-memory task store.
///
/// Ids are assigned from a monotonically increasing counter starting at 1,
/// so creation order and id order coincide.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    tasks: RwLock<BTreeMap<i64, Task>>,
    next_id: AtomicI64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Number of stored tasks across all owners.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, cx: &Deadline, task: NewTask) -> Result<Task, StorageError> {
        cx.run(async {
            let now = Utc::now();
            let created = Task {
                id: self.next_id(),
                user_id: task.user_id,
                title: task.title,
                content: task.content,
                done: task.done,
                created_at: now,
                updated_at: now,
            };
            self.tasks.write().await.insert(created.id, created.clone());
            tracing::debug!(id = created.id, user_id = created.user_id, "task created");
            Ok(created)
        })
        .await?
    }

    async fn list_tasks(&self, cx: &Deadline, user_id: i64) -> Result<Vec<Task>, StorageError> {
        cx.run(async {
            let guard = self.tasks.read().await;
            // newest first; ties broken by id since ids follow creation order
            let mut tasks: Vec<Task> = guard
                .values()
                .filter(|t| t.user_id == user_id)
                .cloned()
                .collect();
            tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(tasks)
        })
        .await?
    }

    async fn get_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<Task, StorageError> {
        cx.run(async {
            let guard = self.tasks.read().await;
            guard
                .get(&id)
                .filter(|t| t.user_id == user_id)
                .cloned()
                .ok_or_else(|| StorageError::not_found(id))
        })
        .await?
    }

    async fn update_task(&self, cx: &Deadline, update: TaskUpdate) -> Result<Task, StorageError> {
        cx.run(async {
            let mut guard = self.tasks.write().await;
            let task = guard
                .get_mut(&update.id)
                .filter(|t| t.user_id == update.user_id)
                .ok_or_else(|| StorageError::not_found(update.id))?;
            task.title = update.title;
            task.content = update.content;
            task.done = update.done;
            task.updated_at = Utc::now();
            Ok::<_, StorageError>(task.clone())
        })
        .await?
    }

    async fn delete_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<(), StorageError> {
        cx.run(async {
            let mut guard = self.tasks.write().await;
            if !guard.get(&id).is_some_and(|t| t.user_id == user_id) {
                return Err(StorageError::not_found(id));
            }
            guard.remove(&id);
            Ok(())
        })
        .await?
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
