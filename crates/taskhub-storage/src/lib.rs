//! # taskhub-storage
//!
//! Storage abstraction layer for the taskhub server.
//!
//! The main trait is [`TaskStore`], the contract every persistence backend
//! and every decorator around one implements:
//! - create a task for an owner
//! - list an owner's tasks, newest first
//! - get, update and delete a task scoped by its owner
//!
//! ## Example
//!
//! ```ignore
//! use taskhub_core::Deadline;
//! use taskhub_storage::{NewTask, StorageError, TaskStore};
//!
//! async fn add(store: &dyn TaskStore, owner: i64) -> Result<i64, StorageError> {
//!     let cx = Deadline::after(std::time::Duration::from_secs(1));
//!     let task = store.create_task(&cx, NewTask::new(owner, "write docs")).await?;
//!     Ok(task.id)
//! }
//! ```

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::TaskStore;
pub use types::{NewTask, Task, TaskUpdate};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared store trait object.
pub type DynTaskStore = std::sync::Arc<dyn TaskStore>;
