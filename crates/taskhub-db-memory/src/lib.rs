//! In-memory task store for the taskhub server.
//!
//! Implements [`TaskStore`] over a process-local map. Used by the test suites
//! and for single-instance development runs without PostgreSQL.
//!
//! # Example
//!
//! ```ignore
//! use taskhub_db_memory::InMemoryTaskStore;
//! use taskhub_storage::{NewTask, TaskStore};
//!
//! let store = InMemoryTaskStore::new();
//! let task = store.create_task(&cx, NewTask::new(1, "A")).await?;
//! assert_eq!(task.id, 1);
//! ```

mod storage;

pub use storage::InMemoryTaskStore;
pub use taskhub_storage::{StorageError, Task, TaskStore};
