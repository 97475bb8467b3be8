//! Mutual exclusion of task mutations through `TaskService`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use taskhub_api::ApiError;
use taskhub_core::Deadline;
use taskhub_db_memory::InMemoryTaskStore;
use taskhub_server::LocalCoordinator;
use taskhub_server::config::LockConfig;
use taskhub_server::lock::{LockCoordinator, LockError};
use taskhub_server::tasks::{TaskError, TaskInput, TaskService};
use taskhub_storage::{DynTaskStore, NewTask, StorageError, Task, TaskStore, TaskUpdate};

/// Records when each write starts and finishes, holding it open for `hold`
/// or for the per-title override.
struct SlowStore {
    inner: InMemoryTaskStore,
    hold: Duration,
    holds: HashMap<String, Duration>,
    events: Mutex<Vec<String>>,
}

impl SlowStore {
    fn new(hold: Duration) -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            hold,
            holds: HashMap::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn with_hold(mut self, title: &str, hold: Duration) -> Self {
        self.holds.insert(title.to_string(), hold);
        self
    }

    fn hold_for(&self, title: &str) -> Duration {
        self.holds.get(title).copied().unwrap_or(self.hold)
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskStore for SlowStore {
    async fn create_task(&self, cx: &Deadline, task: NewTask) -> Result<Task, StorageError> {
        self.inner.create_task(cx, task).await
    }

    async fn list_tasks(&self, cx: &Deadline, user_id: i64) -> Result<Vec<Task>, StorageError> {
        self.inner.list_tasks(cx, user_id).await
    }

    async fn get_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<Task, StorageError> {
        self.inner.get_task(cx, id, user_id).await
    }

    async fn update_task(&self, cx: &Deadline, update: TaskUpdate) -> Result<Task, StorageError> {
        let title = update.title.clone();
        self.record(format!("start {title}"));
        tokio::time::sleep(self.hold_for(&title)).await;
        let result = self.inner.update_task(cx, update).await;
        self.record(format!("end {title}"));
        result
    }

    async fn delete_task(&self, cx: &Deadline, id: i64, user_id: i64) -> Result<(), StorageError> {
        self.record("start delete".into());
        tokio::time::sleep(self.hold).await;
        let result = self.inner.delete_task(cx, id, user_id).await;
        self.record("end delete".into());
        result
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}

fn service(store: Arc<SlowStore>, acquire_timeout_ms: u64) -> Arc<TaskService> {
    service_with_lease(store, 10_000, acquire_timeout_ms)
}

fn service_with_lease(
    store: Arc<SlowStore>,
    lease_ttl_ms: u64,
    acquire_timeout_ms: u64,
) -> Arc<TaskService> {
    let config = LockConfig {
        lease_ttl_ms,
        acquire_timeout_ms,
        retry_interval_ms: 10,
    };
    let locks = LockCoordinator::new(Arc::new(LocalCoordinator::new()), &config);
    let store: DynTaskStore = store;
    Arc::new(TaskService::new(store, locks))
}

fn input(title: &str) -> TaskInput {
    TaskInput {
        title: title.into(),
        content: String::new(),
        done: false,
    }
}

fn cx() -> Deadline {
    Deadline::after(Duration::from_secs(30))
}

#[tokio::test(start_paused = true)]
async fn concurrent_updates_do_not_interleave() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(100)));
    let tasks = service(store.clone(), 5_000);
    let task = tasks.create(&cx(), 1, input("A")).await.unwrap();

    let first = tokio::spawn({
        let tasks = tasks.clone();
        async move { tasks.update(&cx(), task.id, 1, input("B")).await }
    });
    let second = tokio::spawn({
        let tasks = tasks.clone();
        async move { tasks.update(&cx(), task.id, 1, input("C")).await }
    });
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let events = store.events();
    assert_eq!(events.len(), 4);
    for pair in events.chunks(2) {
        let title = pair[0].strip_prefix("start ").unwrap();
        assert_eq!(pair[1], format!("end {title}"));
    }
}

#[tokio::test(start_paused = true)]
async fn update_and_delete_of_same_task_are_serialized() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(100)));
    let tasks = service(store.clone(), 5_000);
    let task = tasks.create(&cx(), 1, input("A")).await.unwrap();

    let update = tokio::spawn({
        let tasks = tasks.clone();
        async move { tasks.update(&cx(), task.id, 1, input("B")).await }
    });
    // let the first writer take the lease
    tokio::time::sleep(Duration::from_millis(5)).await;
    let delete = tokio::spawn({
        let tasks = tasks.clone();
        async move { tasks.delete(&cx(), task.id, 1).await }
    });
    update.await.unwrap().unwrap();
    delete.await.unwrap().unwrap();

    assert_eq!(
        store.events(),
        vec!["start B", "end B", "start delete", "end delete"]
    );
}

#[tokio::test(start_paused = true)]
async fn different_tasks_do_not_block_each_other() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(100)));
    let tasks = service(store.clone(), 5_000);
    let a = tasks.create(&cx(), 1, input("A")).await.unwrap();
    let b = tasks.create(&cx(), 1, input("B")).await.unwrap();

    let cx = cx();
    let started = tokio::time::Instant::now();
    let (ra, rb) = tokio::join!(
        tasks.update(&cx, a.id, 1, input("A2")),
        tasks.update(&cx, b.id, 1, input("B2")),
    );
    ra.unwrap();
    rb.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn waiter_times_out_while_lease_is_held() {
    let store = Arc::new(SlowStore::new(Duration::from_secs(2)));
    let tasks = service(store.clone(), 200);
    let task = tasks.create(&cx(), 1, input("A")).await.unwrap();

    let holder = tokio::spawn({
        let tasks = tasks.clone();
        async move { tasks.update(&cx(), task.id, 1, input("B")).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = tasks
        .update(&cx(), task.id, 1, input("C"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TaskError::Lock(LockError::AcquisitionTimeout { .. })
    ));
    assert_eq!(ApiError::from(err).status_code(), StatusCode::SERVICE_UNAVAILABLE);

    holder.await.unwrap().unwrap();
    assert_eq!(store.events(), vec!["start B", "end B"]);
}

#[tokio::test(start_paused = true)]
async fn lease_is_released_after_failed_write() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(10)));
    let tasks = service(store.clone(), 200);
    let task = tasks.create(&cx(), 1, input("A")).await.unwrap();

    // another owner's update fails inside the lock
    let err = tasks
        .update(&cx(), task.id, 2, input("stolen"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Storage(ref e) if e.is_not_found()));

    let updated = tasks.update(&cx(), task.id, 1, input("B")).await.unwrap();
    assert_eq!(updated.title, "B");
}

#[tokio::test(start_paused = true)]
async fn write_outliving_its_lease_is_abandoned() {
    let store = Arc::new(
        SlowStore::new(Duration::from_millis(10)).with_hold("B", Duration::from_secs(2)),
    );
    let tasks = service_with_lease(store.clone(), 1_000, 5_000);
    let task = tasks.create(&cx(), 1, input("A")).await.unwrap();

    let slow = tokio::spawn({
        let tasks = tasks.clone();
        async move { tasks.update(&cx(), task.id, 1, input("B")).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    let fast = tokio::spawn({
        let tasks = tasks.clone();
        async move { tasks.update(&cx(), task.id, 1, input("C")).await }
    });

    let err = slow.await.unwrap().unwrap_err();
    assert!(matches!(err, TaskError::Lock(LockError::LeaseExpired { .. })));
    assert_eq!(fast.await.unwrap().unwrap().title, "C");

    // B never reaches the store once its lease is gone
    assert_eq!(store.events(), vec!["start B", "start C", "end C"]);
    let current = tasks.get(&cx(), task.id, 1).await.unwrap();
    assert_eq!(current.title, "C");
}
