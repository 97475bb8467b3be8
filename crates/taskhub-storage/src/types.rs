//! Task types exchanged with storage backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted task.
///
/// The serialized form is shared with other services reading the same
/// cache entries, so field names are part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Server-assigned identifier.
    pub id: i64,
    /// Owner identity.
    pub user_id: i64,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub done: bool,
    pub created_at: DateTime<Utc>,
    // wire name shared with existing cache entries
    #[serde(rename = "update_at")]
    pub updated_at: DateTime<Utc>,
}

/// A task to be created. The store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub done: bool,
}

impl NewTask {
    /// Creates a not-done task with empty content.
    pub fn new(user_id: i64, title: impl Into<String>) -> Self {
        Self {
            user_id,
            title: title.into(),
            content: String::new(),
            done: false,
        }
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    #[must_use]
    pub fn with_done(mut self, done: bool) -> Self {
        self.done = done;
        self
    }
}

/// Full replacement of a task's mutable fields, scoped by owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub done: bool,
}
