//! Distributed locking for task mutations.

pub mod backend;
pub mod coordinator;

pub use backend::{CoordinationBackend, LocalCoordinator, LockError, RedisCoordinator};
pub use coordinator::{LeaseGuard, LockCoordinator, lock_key};
