//! PostgreSQL implementation of [`TaskStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use tracing::{debug, instrument};

use taskhub_core::Deadline;
use taskhub_storage::{NewTask, StorageError, Task, TaskStore, TaskUpdate};

use crate::config::PostgresConfig;
use crate::error::storage_error;
use crate::{migrations, pool};

type TaskRow = (i64, i64, String, String, bool, DateTime<Utc>, DateTime<Utc>);

const TASK_COLUMNS: &str = "id, user_id, title, content, done, created_at, updated_at";

fn into_task(row: TaskRow) -> Task {
    let (id, user_id, title, content, done, created_at, updated_at) = row;
    Task {
        id,
        user_id,
        title,
        content,
        done,
        created_at,
        updated_at,
    }
}

/// Task store backed by a `tasks` table.
///
/// Every statement is scoped by `user_id`, so a foreign owner's row is
/// indistinguishable from a missing one.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Creates a store over an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the pool and applies migrations when configured to.
    pub async fn new(config: &PostgresConfig) -> crate::error::Result<Self> {
        let pool = pool::create_pool(config).await?;
        if config.run_migrations {
            migrations::run(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, cx, task), fields(user_id = task.user_id))]
    async fn create_task(&self, cx: &Deadline, task: NewTask) -> Result<Task, StorageError> {
        let sql = format!(
            "INSERT INTO tasks (user_id, title, content, done) VALUES ($1, $2, $3, $4) \
             RETURNING {TASK_COLUMNS}"
        );
        let row: TaskRow = cx
            .run(
                query_as(&sql)
                    .bind(task.user_id)
                    .bind(task.title)
                    .bind(task.content)
                    .bind(task.done)
                    .fetch_one(&self.pool),
            )
            .await?
            .map_err(storage_error)?;

        debug!(id = row.0, "task inserted");
        Ok(into_task(row))
    }

    #[instrument(skip(self, cx))]
    async fn list_tasks(&self, cx: &Deadline, user_id: i64) -> Result<Vec<Task>, StorageError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        );
        let rows: Vec<TaskRow> = cx
            .run(query_as(&sql).bind(user_id).fetch_all(&self.pool))
            .await?
            .map_err(storage_error)?;

        Ok(rows.into_iter().map(into_task).collect())
    }

    #[instrument(skip(self, cx))]
    async fn get_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<Task, StorageError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND user_id = $2");
        let row: Option<TaskRow> = cx
            .run(
                query_as(&sql)
                    .bind(id)
                    .bind(user_id)
                    .fetch_optional(&self.pool),
            )
            .await?
            .map_err(storage_error)?;

        row.map(into_task).ok_or_else(|| StorageError::not_found(id))
    }

    #[instrument(skip(self, cx, update), fields(id = update.id, user_id = update.user_id))]
    async fn update_task(&self, cx: &Deadline, update: TaskUpdate) -> Result<Task, StorageError> {
        let sql = format!(
            "UPDATE tasks SET title = $1, content = $2, done = $3, updated_at = now() \
             WHERE id = $4 AND user_id = $5 RETURNING {TASK_COLUMNS}"
        );
        let id = update.id;
        let row: Option<TaskRow> = cx
            .run(
                query_as(&sql)
                    .bind(update.title)
                    .bind(update.content)
                    .bind(update.done)
                    .bind(update.id)
                    .bind(update.user_id)
                    .fetch_optional(&self.pool),
            )
            .await?
            .map_err(storage_error)?;

        row.map(into_task).ok_or_else(|| StorageError::not_found(id))
    }

    #[instrument(skip(self, cx))]
    async fn delete_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<(), StorageError> {
        let result = cx
            .run(
                query("DELETE FROM tasks WHERE id = $1 AND user_id = $2")
                    .bind(id)
                    .bind(user_id)
                    .execute(&self.pool),
            )
            .await?
            .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(id));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
