//! # taskhub-core
//!
//! Types shared by every layer of the task service. The main one is
//! [`Deadline`], the request-scoped context that bounds every call into the
//! store, the cache and the coordination backend.

pub mod deadline;

pub use deadline::{Deadline, DeadlineExceeded};
