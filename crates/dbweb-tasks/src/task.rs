//! AsyncTask: one long-running server operation.
//!
//! The task starts with no info. `run()` performs the initiating request
//! once; afterwards status arrives either as full snapshots (via
//! `update_info_async`) or as cheap status patches pushed by the server
//! (`update_status`). The first non-running snapshot settles the outcome.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use dbweb_core::{SyncExecutor, TaskInfo, WsTaskInfo};

use crate::config::TaskConfig;
use crate::error::TaskError;

pub type TaskFuture<T> = BoxFuture<'static, Result<T, TaskError>>;

/// Invoked with the server task id to request cancellation.
pub type CancelFn = Arc<dyn Fn(String) -> TaskFuture<()> + Send + Sync>;

type InitFn = Box<dyn FnOnce() -> TaskFuture<TaskInfo> + Send>;

pub type TaskOutcome = Result<TaskInfo, TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    Init,
    Refresh,
}

#[derive(Default)]
struct TaskState {
    info: Option<TaskInfo>,
    cancelled: bool,
    updating: Option<UpdateKind>,
    updated_at: Option<DateTime<Utc>>,
}

impl TaskState {
    fn pending(&self) -> bool {
        self.info.as_ref().is_some_and(|info| info.running) || self.updating.is_some()
    }
}

struct TaskInner {
    id: String,
    init: Mutex<Option<InitFn>>,
    cancel: CancelFn,
    state: Mutex<TaskState>,
    run_result: watch::Sender<Option<Result<(), TaskError>>>,
    outcome: watch::Sender<Option<TaskOutcome>>,
    on_status_change: SyncExecutor<TaskInfo>,
    retry_delay: Duration,
}

/// Handle to a tracked task. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AsyncTask {
    inner: Arc<TaskInner>,
}

/// Publishes `Abandoned` if the init run ends without a result (panic or
/// runtime shutdown), so waiting `run()` callers are released.
struct RunGuard(Arc<TaskInner>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.run_result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(Err(TaskError::Abandoned));
            true
        });
    }
}

/// Resets the in-flight marker when an update finishes, fails or is dropped.
struct UpdatingGuard<'a>(&'a TaskInner);

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().updating = None;
    }
}

impl AsyncTask {
    pub fn new<I, Fut>(init: I, cancel: CancelFn, config: &TaskConfig) -> Self
    where
        I: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<TaskInfo, TaskError>> + Send + 'static,
    {
        let init: InitFn = Box::new(move || init().boxed());
        let (outcome, _) = watch::channel(None);
        let (run_result, _) = watch::channel(None);
        Self {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4().to_string(),
                init: Mutex::new(Some(init)),
                cancel,
                state: Mutex::new(TaskState::default()),
                run_result,
                outcome,
                on_status_change: SyncExecutor::new(),
                retry_delay: config.init_retry_delay,
            }),
        }
    }

    /// Local id, stable for the task's lifetime.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Server-assigned id, known once the first snapshot has been applied.
    pub fn server_id(&self) -> Option<String> {
        self.inner.state.lock().info.as_ref().map(|info| info.id.clone())
    }

    pub fn info(&self) -> Option<TaskInfo> {
        self.inner.state.lock().info.clone()
    }

    pub fn cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Running on the server or with an update in flight.
    pub fn pending(&self) -> bool {
        self.inner.state.lock().pending()
    }

    /// When the last snapshot or status patch was applied.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().updated_at
    }

    /// Fired synchronously with the current snapshot on every applied status.
    pub fn on_status_change(&self) -> &SyncExecutor<TaskInfo> {
        &self.inner.on_status_change
    }

    /// Perform the initiating request. Runs `init` at most once; concurrent
    /// and later callers get the result of that single run.
    ///
    /// The run is detached from the caller: dropping a `run()` future does
    /// not stop initialization or affect other callers.
    pub async fn run(&self) -> Result<(), TaskError> {
        let init = self.inner.init.lock().take();
        if let Some(init) = init {
            let task = self.clone();
            let single_run = async move {
                let guard = RunGuard(Arc::clone(&task.inner));
                let result = task.update_info_async(init).await;
                task.inner.run_result.send_replace(Some(result));
                drop(guard);
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(single_run);
                }
                Err(_) => {
                    warn!(task = %self.inner.id, "no tokio runtime, initializing inline");
                    single_run.await;
                }
            }
        }

        let mut rx = self.inner.run_result.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone().unwrap_or(Err(TaskError::Abandoned)),
            Err(_) => Err(TaskError::Abandoned),
        }
    }

    /// Fetch a fresh snapshot with `getter` and apply it.
    ///
    /// Updates for one task never interleave. A call arriving while another
    /// update is in flight is dropped, unless the in-flight update is the
    /// initialization; then it is retried after the configured delay.
    pub async fn update_info_async<F, Fut>(&self, getter: F) -> Result<(), TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TaskInfo, TaskError>>,
    {
        let kind = loop {
            {
                let mut state = self.inner.state.lock();
                match state.updating {
                    None => {
                        let kind = if state.info.is_none() {
                            UpdateKind::Init
                        } else {
                            UpdateKind::Refresh
                        };
                        if kind == UpdateKind::Init && state.cancelled {
                            return Err(TaskError::Cancelled);
                        }
                        state.updating = Some(kind);
                        break kind;
                    }
                    Some(UpdateKind::Refresh) => {
                        trace!(task = %self.inner.id, "update already in flight, dropping");
                        return Ok(());
                    }
                    Some(UpdateKind::Init) => {
                        trace!(task = %self.inner.id, "initialization in flight, retrying update");
                    }
                }
            }
            tokio::time::sleep(self.inner.retry_delay).await;
        };

        let _updating = UpdatingGuard(&self.inner);
        let info = getter().await?;
        self.apply_info(info);

        if kind == UpdateKind::Init && self.cancelled() {
            debug!(task = %self.inner.id, "cancelled during initialization");
            self.cancel_task().await?;
        }
        Ok(())
    }

    /// Patch the status name from a push event. Ignored until the first
    /// snapshot exists.
    pub fn update_status(&self, push: &WsTaskInfo) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            let Some(info) = state.info.as_mut() else {
                return;
            };
            info.status = push.status_name.clone();
            let snapshot = info.clone();
            state.updated_at = Some(Utc::now());
            snapshot
        };
        self.inner.on_status_change.execute(&snapshot);
    }

    /// Request cancellation. A second request while the first is accepted is
    /// a no-op; a failed request leaves the task cancellable again.
    pub async fn cancel_async(&self) -> Result<(), TaskError> {
        {
            let mut state = self.inner.state.lock();
            if state.cancelled {
                return Ok(());
            }
            if !state.pending() {
                return Err(TaskError::NotPending);
            }
            state.cancelled = true;
        }

        if let Err(e) = self.cancel_task().await {
            self.inner.state.lock().cancelled = false;
            return Err(e);
        }
        Ok(())
    }

    /// Wait for the task to settle.
    pub async fn outcome(&self) -> TaskOutcome {
        let mut rx = self.inner.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(settled) => (*settled).clone().unwrap_or(Err(TaskError::Abandoned)),
            Err(_) => Err(TaskError::Abandoned),
        }
    }

    /// Settled outcome, if any, without waiting.
    pub fn try_outcome(&self) -> Option<TaskOutcome> {
        self.inner.outcome.borrow().clone()
    }

    async fn cancel_task(&self) -> Result<(), TaskError> {
        match self.server_id() {
            Some(id) => (self.inner.cancel)(id).await,
            None => Ok(()),
        }
    }

    fn apply_info(&self, info: TaskInfo) {
        {
            let mut state = self.inner.state.lock();
            state.info = Some(info.clone());
            state.updated_at = Some(Utc::now());
        }

        if !info.running {
            let outcome = match &info.error {
                Some(error) => Err(TaskError::Server(error.clone())),
                None => Ok(info.clone()),
            };
            let settled = self.inner.outcome.send_if_modified(|slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(outcome);
                true
            });
            if settled {
                debug!(task = %self.inner.id, server_id = %info.id, failed = info.error.is_some(), "task settled");
            }
        }

        self.inner.on_status_change.execute(&info);
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AsyncTask")
            .field("id", &self.inner.id)
            .field("info", &state.info)
            .field("cancelled", &state.cancelled)
            .field("pending", &state.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dbweb_core::ServerError;
    use tokio::sync::Notify;

    fn counting_cancel() -> (CancelFn, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let cancel: CancelFn = Arc::new(move |id: String| {
            sink.lock().push(id);
            async { Ok::<(), TaskError>(()) }.boxed()
        });
        (cancel, calls)
    }

    fn task_with(info: TaskInfo) -> (AsyncTask, Arc<Mutex<Vec<String>>>) {
        let (cancel, calls) = counting_cancel();
        let task = AsyncTask::new(move || async move { Ok(info) }, cancel, &TaskConfig::default());
        (task, calls)
    }

    #[tokio::test]
    async fn run_settles_on_finished_snapshot() {
        let (task, _) = task_with(TaskInfo::finished("s1"));
        assert!(task.info().is_none());
        assert!(!task.pending());

        task.run().await.unwrap();
        assert_eq!(task.server_id().as_deref(), Some("s1"));
        assert!(task.updated_at().is_some());
        assert_eq!(task.outcome().await.unwrap().id, "s1");
        assert!(!task.pending());
    }

    #[tokio::test]
    async fn run_is_single_flight_and_late_run_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (cancel, _) = counting_cancel();
        let task = AsyncTask::new(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(TaskInfo::finished("s1"))
            },
            cancel,
            &TaskConfig::default(),
        );

        let (a, b) = tokio::join!(task.run(), task.run());
        a.unwrap();
        b.unwrap();
        task.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_runner_does_not_abandon_initialization() {
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (cancel, _) = counting_cancel();
        let task = AsyncTask::new(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok(TaskInfo::running("s1", "queued"))
            },
            cancel,
            &TaskConfig::default(),
        );

        let first = tokio::spawn({
            let task = task.clone();
            async move { task.run().await }
        });
        while !task.pending() {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let task = task.clone();
            async move { task.run().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        first.abort();
        assert!(first.await.is_err());

        gate.notify_one();
        second.await.unwrap().unwrap();
        assert_eq!(task.server_id().as_deref(), Some("s1"));
        task.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_rejects_outcome() {
        let (task, _) = task_with(TaskInfo::failed("s1", ServerError::new("boom")));
        task.run().await.unwrap();
        assert_eq!(
            task.outcome().await,
            Err(TaskError::Server(ServerError::new("boom")))
        );
    }

    #[tokio::test]
    async fn outcome_settles_exactly_once() {
        let (task, _) = task_with(TaskInfo::running("s1", "queued"));
        task.run().await.unwrap();
        assert!(task.try_outcome().is_none());

        task.update_info_async(|| async { Ok(TaskInfo::finished("s1")) })
            .await
            .unwrap();
        task.update_info_async(|| async { Ok(TaskInfo::failed("s1", ServerError::new("late"))) })
            .await
            .unwrap();

        assert!(matches!(task.try_outcome(), Some(Ok(info)) if info.id == "s1"));
    }

    #[tokio::test]
    async fn status_patch_requires_info() {
        let (task, _) = task_with(TaskInfo::running("s1", "queued"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        task.on_status_change()
            .add_handler(move |info: &TaskInfo| sink.lock().push(info.status.clone()));

        let push = WsTaskInfo {
            task_id: "s1".into(),
            status_name: Some("Executing".into()),
            running: true,
        };
        task.update_status(&push);
        assert!(seen.lock().is_empty());

        task.run().await.unwrap();
        task.update_status(&push);
        assert_eq!(
            *seen.lock(),
            vec![Some("queued".to_string()), Some("Executing".to_string())]
        );
    }

    #[tokio::test]
    async fn concurrent_cancel_reaches_server_once() {
        let (task, calls) = task_with(TaskInfo::running("s1", "queued"));
        task.run().await.unwrap();

        let (a, b) = tokio::join!(task.cancel_async(), task.cancel_async());
        a.unwrap();
        b.unwrap();
        assert!(task.cancelled());
        assert_eq!(*calls.lock(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn cancel_finished_task_fails() {
        let (task, calls) = task_with(TaskInfo::finished("s1"));
        task.run().await.unwrap();
        assert_eq!(task.cancel_async().await, Err(TaskError::NotPending));
        assert!(!task.cancelled());
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_cancel_rolls_back() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cancel: CancelFn = Arc::new(move |_: String| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(TaskError::Api("unreachable".into()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        });
        let task = AsyncTask::new(
            || async { Ok(TaskInfo::running("s1", "queued")) },
            cancel,
            &TaskConfig::default(),
        );
        task.run().await.unwrap();

        assert!(task.cancel_async().await.is_err());
        assert!(!task.cancelled());
        task.cancel_async().await.unwrap();
        assert!(task.cancelled());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_during_init_is_sent_once_id_is_known() {
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let (cancel, calls) = counting_cancel();
        let task = AsyncTask::new(
            move || async move {
                release.notified().await;
                Ok(TaskInfo::running("s1", "queued"))
            },
            cancel,
            &TaskConfig::default(),
        );

        let runner = tokio::spawn({
            let task = task.clone();
            async move { task.run().await }
        });
        while !task.pending() {
            tokio::task::yield_now().await;
        }
        task.cancel_async().await.unwrap();
        assert!(calls.lock().is_empty(), "no server id yet");

        gate.notify_one();
        runner.await.unwrap().unwrap();
        assert_eq!(*calls.lock(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn init_after_cancel_fails() {
        let (task, _) = task_with(TaskInfo::running("s1", "queued"));
        // cancel_async refuses tasks that are not pending yet.
        task.inner.state.lock().cancelled = true;
        assert_eq!(task.run().await, Err(TaskError::Cancelled));
        assert!(task.info().is_none());
    }

    #[tokio::test]
    async fn refresh_during_refresh_is_dropped() {
        let (task, _) = task_with(TaskInfo::running("s1", "queued"));
        task.run().await.unwrap();

        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let first = tokio::spawn({
            let task = task.clone();
            async move {
                task.update_info_async(|| async move {
                    release.notified().await;
                    Ok(TaskInfo::running("s1", "first"))
                })
                .await
            }
        });
        while task.inner.state.lock().updating.is_none() {
            tokio::task::yield_now().await;
        }

        let second_called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&second_called);
        task.update_info_async(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TaskInfo::finished("s1"))
        })
        .await
        .unwrap();

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(second_called.load(Ordering::SeqCst), 0);
        assert_eq!(task.info().and_then(|i| i.status).as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn refresh_during_init_is_retried() {
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let (cancel, _) = counting_cancel();
        let task = AsyncTask::new(
            move || async move {
                release.notified().await;
                Ok(TaskInfo::running("s1", "queued"))
            },
            cancel,
            &TaskConfig::default(),
        );

        let runner = tokio::spawn({
            let task = task.clone();
            async move { task.run().await }
        });
        while !task.pending() {
            tokio::task::yield_now().await;
        }

        let refresh = tokio::spawn({
            let task = task.clone();
            async move {
                task.update_info_async(|| async { Ok(TaskInfo::finished("s1")) })
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        gate.notify_one();
        runner.await.unwrap().unwrap();
        refresh.await.unwrap().unwrap();

        assert!(matches!(task.outcome().await, Ok(info) if !info.running));
    }
}
