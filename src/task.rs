//! Background tasks with timeout supervision and de-duplication.
//!
//! [`Application::execute_task`] runs a [`Task`] once in the background
//! after its delay. [`Application::execute_async_task`] does the same for an
//! [`AsyncTask`], except that submissions sharing a name while one is still
//! waiting out its delay are folded into the waiting instance through
//! [`AsyncTask::aggregate`] instead of running again.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, warn};

use crate::app::Application;

// ── TaskResult ────────────────────────────────────────────────────────────────

/// What `execute` hands to `completed`.
#[derive(Debug, Default)]
pub struct TaskResult {
    pub error: Option<Box<dyn StdError + Send + Sync>>,
    pub data: Option<Value>,
}

impl TaskResult {
    pub fn ok(data: Value) -> Self {
        Self { error: None, data: Some(data) }
    }

    pub fn err(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self { error: Some(error.into()), data: None }
    }

    pub fn is_ok(&self) -> bool { self.error.is_none() }
}

// ── Cancellation ──────────────────────────────────────────────────────────────

/// Signalled when the supervisor gives up on a running `execute`.
#[derive(Clone)]
pub struct Cancellation(watch::Receiver<bool>);

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the task has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        // Err means the supervisor is gone, which only happens after it
        // has stopped waiting for us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cancellation").field(&self.is_cancelled()).finish()
    }
}

// ── Task traits ───────────────────────────────────────────────────────────────

/// A unit of background work.
///
/// Hooks run in order `before_execute`, `execute`, `after_execute`,
/// `completed`. If `execute` outlives [`timeout_after`](Task::timeout_after)
/// only `timeout` runs after it, and whatever `execute` returns later is
/// dropped.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    async fn before_execute(&self, _app: &Application) {}

    /// Runs on its own tokio task. Watch `cancel` to stop early after a
    /// timeout.
    async fn execute(&self, app: &Application, cancel: Cancellation) -> TaskResult;

    async fn after_execute(&self, _app: &Application) {}

    async fn completed(&self, _app: &Application, _result: TaskResult) {}

    async fn timeout(&self, _app: &Application) {}

    /// Zero disables the timeout.
    fn timeout_after(&self) -> Duration { Duration::ZERO }

    /// Waited out before `before_execute`.
    fn delay(&self) -> Duration { Duration::ZERO }
}

/// A [`Task`] de-duplicated by name while it waits out its delay.
pub trait AsyncTask: Task {
    fn name(&self) -> &str;

    /// Folds `incoming`, a later submission under the same name, into this
    /// pending instance. Called under the registry's write lock; must not
    /// submit async tasks itself.
    fn aggregate(&self, app: &Application, incoming: Arc<dyn AsyncTask>);
}

/// Async tasks waiting out their delay, by name.
#[derive(Default)]
pub(crate) struct AsyncTaskRegistry {
    pending: RwLock<HashMap<String, Arc<dyn AsyncTask>>>,
}

// ── Scheduling ────────────────────────────────────────────────────────────────

impl Application {
    /// Runs `task` in the background after its delay.
    pub fn execute_task(&self, task: Arc<dyn Task>) {
        let app = self.clone();
        tokio::spawn(
            async move {
                tokio::time::sleep(task.delay()).await;
                supervise(app, task).await;
            }
            .in_current_span(),
        );
    }

    /// Runs `task` in the background after its delay unless an instance
    /// with the same name is already waiting, in which case that instance
    /// aggregates `task` and `task` itself never runs.
    pub fn execute_async_task(&self, task: Arc<dyn AsyncTask>) {
        let name = task.name().to_owned();
        {
            let mut pending = self.async_tasks().pending.write();
            if let Some(existing) = pending.get(&name) {
                existing.aggregate(self, task);
                debug!(task = %name, "aggregated into pending task");
                return;
            }
            pending.insert(name.clone(), Arc::clone(&task));
        }

        let app = self.clone();
        tokio::spawn(
            async move {
                tokio::time::sleep(task.delay()).await;
                {
                    let mut pending = app.async_tasks().pending.write();
                    if pending.get(&name).is_some_and(|p| Arc::ptr_eq(p, &task)) {
                        pending.remove(&name);
                    }
                }
                supervise(app, task).await;
            }
            .in_current_span(),
        );
    }
}

/// Runs the hooks of `task`, racing `execute` against its timeout.
async fn supervise<T: Task + ?Sized>(app: Application, task: Arc<T>) {
    task.before_execute(&app).await;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let worker = {
        let app = app.clone();
        let task = Arc::clone(&task);
        tokio::spawn(async move { task.execute(&app, Cancellation(cancel_rx)).await }.in_current_span())
    };

    let limit = task.timeout_after();
    let joined = if limit.is_zero() {
        Ok(worker.await)
    } else {
        tokio::time::timeout(limit, worker).await
    };

    match joined {
        Ok(Ok(result)) => {
            task.after_execute(&app).await;
            task.completed(&app, result).await;
        }
        Ok(Err(e)) => {
            error!(error = %e, "task execute failed");
            task.completed(&app, TaskResult::err(format!("task execute failed: {e}"))).await;
        }
        Err(_) => {
            cancel_tx.send_replace(true);
            warn!(timeout_ms = limit.as_millis() as u64, "task timed out");
            task.timeout(&app).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::config::Config;

    #[derive(Default)]
    struct Counters {
        execute: AtomicUsize,
        completed: AtomicUsize,
        timeout: AtomicUsize,
        cancelled: AtomicUsize,
    }

    struct Probe {
        name: &'static str,
        work: Duration,
        limit: Duration,
        delay: Duration,
        panics: bool,
        counters: Arc<Counters>,
        events: Mutex<Vec<&'static str>>,
        aggregated: AtomicUsize,
        result: Mutex<Option<TaskResult>>,
    }

    impl Probe {
        fn new(counters: &Arc<Counters>) -> Self {
            Self {
                name: "probe",
                work: Duration::from_millis(10),
                limit: Duration::ZERO,
                delay: Duration::ZERO,
                panics: false,
                counters: Arc::clone(counters),
                events: Mutex::new(Vec::new()),
                aggregated: AtomicUsize::new(0),
                result: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Task for Probe {
        async fn before_execute(&self, _: &Application) {
            self.events.lock().push("before");
        }

        async fn execute(&self, _: &Application, cancel: Cancellation) -> TaskResult {
            self.counters.execute.fetch_add(1, Ordering::SeqCst);
            self.events.lock().push("execute");
            if self.panics {
                panic!("task blew up");
            }
            tokio::select! {
                () = tokio::time::sleep(self.work) => TaskResult::ok(json!({"done": true})),
                () = cancel.cancelled() => {
                    self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
                    TaskResult::default()
                }
            }
        }

        async fn after_execute(&self, _: &Application) {
            self.events.lock().push("after");
        }

        async fn completed(&self, _: &Application, result: TaskResult) {
            self.counters.completed.fetch_add(1, Ordering::SeqCst);
            self.events.lock().push("completed");
            *self.result.lock() = Some(result);
        }

        async fn timeout(&self, _: &Application) {
            self.counters.timeout.fetch_add(1, Ordering::SeqCst);
            self.events.lock().push("timeout");
        }

        fn timeout_after(&self) -> Duration { self.limit }
        fn delay(&self) -> Duration { self.delay }
    }

    impl AsyncTask for Probe {
        fn name(&self) -> &str { self.name }

        fn aggregate(&self, _: &Application, _incoming: Arc<dyn AsyncTask>) {
            self.aggregated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn app() -> Application {
        Application::new(Config::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_run_in_order() {
        let counters = Arc::new(Counters::default());
        let probe = Arc::new(Probe::new(&counters));
        app().execute_task(probe.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*probe.events.lock(), ["before", "execute", "after", "completed"]);
        let result = probe.result.lock().take().unwrap();
        assert!(result.is_ok());
        assert_eq!(result.data, Some(json!({"done": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_waited_out_first() {
        let counters = Arc::new(Counters::default());
        let mut probe = Probe::new(&counters);
        probe.delay = Duration::from_millis(100);
        app().execute_task(Arc::new(probe));

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(counters.execute.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counters.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_wins_and_late_result_is_dropped() {
        let counters = Arc::new(Counters::default());
        let mut probe = Probe::new(&counters);
        probe.work = Duration::from_secs(10);
        probe.limit = Duration::from_secs(1);
        let probe = Arc::new(probe);
        app().execute_task(probe.clone());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(*probe.events.lock(), ["before", "execute", "timeout"]);
        assert_eq!(counters.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(counters.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_never_fires() {
        let counters = Arc::new(Counters::default());
        let mut probe = Probe::new(&counters);
        probe.work = Duration::from_secs(3600);
        app().execute_task(Arc::new(probe));

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert_eq!(counters.timeout.load(Ordering::SeqCst), 0);
        assert_eq!(counters.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_execute_completes_with_error() {
        let counters = Arc::new(Counters::default());
        let mut probe = Probe::new(&counters);
        probe.panics = true;
        let probe = Arc::new(probe);
        app().execute_task(probe.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = probe.result.lock().take().unwrap();
        assert!(!result.is_ok());
        assert!(!probe.events.lock().contains(&"after"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_name_submissions_aggregate_into_one_run() {
        let app = app();
        let counters = Arc::new(Counters::default());
        let mut first = Probe::new(&counters);
        first.name = "refresh";
        first.delay = Duration::from_millis(50);
        let first = Arc::new(first);
        app.execute_async_task(first.clone());

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let mut again = Probe::new(&counters);
            again.name = "refresh";
            again.delay = Duration::from_millis(50);
            app.execute_async_task(Arc::new(again));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(first.aggregated.load(Ordering::SeqCst), 4);
        assert_eq!(counters.execute.load(Ordering::SeqCst), 1);
        assert_eq!(counters.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submission_after_the_delay_starts_a_new_run() {
        let app = app();
        let counters = Arc::new(Counters::default());
        for _ in 0..2 {
            let mut probe = Probe::new(&counters);
            probe.name = "refresh";
            probe.delay = Duration::from_millis(50);
            app.execute_async_task(Arc::new(probe));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(counters.execute.load(Ordering::SeqCst), 2);
    }
}
