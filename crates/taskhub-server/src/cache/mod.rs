//! Shared cache: backends plus the cache-aside task store decorator.

pub mod backend;
pub mod store;

pub use backend::{CacheBackend, CacheError, LocalCache, RedisCache};
pub use store::{CachedTaskStore, task_key, user_key};
