//! End-to-end registry scenarios over an in-process session source.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use dbweb_core::{ServerError, ServerEvent, TaskInfo, WsTaskInfo};
use dbweb_events::{SessionEventSource, TopicEventHandler};
use dbweb_tasks::{AsyncTaskRegistry, TaskApi, TaskConfig, TaskError};

// ─── Mock API ─────────────────────────────────────────────────────

#[derive(Default)]
struct MockApi {
    infos: Mutex<HashMap<String, TaskInfo>>,
    fetches: Mutex<Vec<(String, bool)>>,
    cancels: Mutex<Vec<String>>,
}

impl MockApi {
    fn set(&self, info: TaskInfo) {
        self.infos.lock().insert(info.id.clone(), info);
    }
}

#[async_trait]
impl TaskApi for MockApi {
    async fn get_task_info(
        &self,
        task_id: &str,
        remove_on_finish: bool,
    ) -> Result<TaskInfo, TaskError> {
        self.fetches
            .lock()
            .push((task_id.to_owned(), remove_on_finish));
        self.infos
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::Api(format!("unknown task {task_id}")))
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), TaskError> {
        self.cancels.lock().push(task_id.to_owned());
        Ok(())
    }
}

// ─── Harness ──────────────────────────────────────────────────────

struct Harness {
    source: Arc<SessionEventSource>,
    outbound: mpsc::Receiver<ServerEvent>,
    api: Arc<MockApi>,
    registry: Arc<AsyncTaskRegistry>,
}

fn harness() -> Harness {
    let (source, outbound) = SessionEventSource::new(64, 64);
    let source = Arc::new(source);
    let events = TopicEventHandler::task_info(source.clone());
    let api = Arc::new(MockApi::default());
    let registry = AsyncTaskRegistry::new(
        api.clone(),
        events,
        TaskConfig {
            init_retry_delay: Duration::from_millis(20),
        },
    );
    Harness {
        source,
        outbound,
        api,
        registry,
    }
}

fn push(source: &SessionEventSource, task_id: &str, running: bool, status: Option<&str>) {
    let event = ServerEvent::encode(
        "cb_session_task_info_updated",
        "cb_session_task",
        &WsTaskInfo {
            task_id: task_id.to_owned(),
            status_name: status.map(str::to_owned),
            running,
        },
    )
    .unwrap();
    source.ingest(event);
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

// ─── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn early_finish_event_is_buffered_and_replayed_once() {
    let h = harness();
    h.api.set(TaskInfo::finished("s1"));

    let gate = Arc::new(Notify::new());
    let release = Arc::clone(&gate);
    let task = h.registry.create(move || async move {
        release.notified().await;
        Ok(TaskInfo::running("s1", "queued"))
    });
    assert!(h.registry.is_connected());

    let runner = tokio::spawn({
        let registry = Arc::clone(&h.registry);
        let task = task.clone();
        async move { registry.run(&task).await }
    });

    push(&h.source, "s1", false, None);
    eventually("event buffered", || h.registry.buffered_event_count() == 1).await;
    assert!(task.info().is_none());

    gate.notify_one();
    let info = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(info.id, "s1");
    assert!(!info.running);
    assert_eq!(h.registry.buffered_event_count(), 0);
    assert_eq!(*h.api.fetches.lock(), vec![("s1".to_string(), false)]);
    assert_eq!(h.registry.get("s1").map(|t| t.id().to_owned()), Some(task.id().to_owned()));
}

#[tokio::test]
async fn running_push_patches_status_without_fetch() {
    let h = harness();
    let task = h
        .registry
        .create(|| async { Ok(TaskInfo::running("s1", "queued")) });
    task.run().await.unwrap();

    push(&h.source, "s1", true, Some("Executing"));
    eventually("status patched", || {
        task.info().and_then(|info| info.status).as_deref() == Some("Executing")
    })
    .await;
    assert!(h.api.fetches.lock().is_empty());
    assert!(task.try_outcome().is_none());
}

#[tokio::test]
async fn finish_push_for_known_task_refetches() {
    let h = harness();
    let task = h
        .registry
        .create(|| async { Ok(TaskInfo::running("s1", "queued")) });
    task.run().await.unwrap();

    h.api.set(TaskInfo::failed("s1", ServerError::new("syntax error")));
    push(&h.source, "s1", false, None);

    let outcome = tokio::time::timeout(Duration::from_secs(2), task.outcome())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Err(TaskError::Server(ServerError::new("syntax error")))
    );
}

#[tokio::test]
async fn buffered_events_are_last_write_wins() {
    let h = harness();
    let _task = h
        .registry
        .create(|| async { Ok(TaskInfo::running("other", "queued")) });

    push(&h.source, "zz", true, Some("Queued"));
    push(&h.source, "zz", true, Some("Executing"));
    eventually("buffered", || h.registry.buffered_event_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.registry.buffered_event_count(), 1);
}

#[tokio::test]
async fn server_error_rejects_run() {
    let h = harness();
    let task = h
        .registry
        .create(|| async { Ok(TaskInfo::failed("s1", ServerError::new("boom"))) });

    assert_eq!(
        h.registry.run(&task).await,
        Err(TaskError::Server(ServerError::new("boom")))
    );
}

#[tokio::test]
async fn late_run_does_not_reinitialize() {
    let h = harness();
    let inits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&inits);
    let task = h.registry.create(move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(TaskInfo::finished("s1"))
    });

    let first = h.registry.run(&task).await.unwrap();
    task.run().await.unwrap();
    let second = h.registry.run(&task).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(inits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn double_cancel_reaches_server_once() {
    let h = harness();
    let task = h
        .registry
        .create(|| async { Ok(TaskInfo::running("s1", "queued")) });
    task.run().await.unwrap();

    let (a, b) = tokio::join!(h.registry.cancel(task.id()), h.registry.cancel("s1"));
    a.unwrap();
    b.unwrap();
    assert!(task.cancelled());
    assert_eq!(*h.api.cancels.lock(), vec!["s1".to_string()]);

    h.registry.cancel("missing").await.unwrap();
}

#[tokio::test]
async fn removing_pending_task_fails_and_keeps_state() {
    let h = harness();
    let task = h
        .registry
        .create(|| async { Ok(TaskInfo::running("s1", "queued")) });
    task.run().await.unwrap();

    let err = h.registry.remove("s1").await.unwrap_err();
    assert_eq!(err, TaskError::StillPending(task.id().to_owned()));
    assert_eq!(h.registry.len(), 1);
    assert!(h.registry.get("s1").is_some());
    assert!(h.registry.is_connected());
    assert!(h.api.fetches.lock().is_empty());
}

#[tokio::test]
async fn removing_last_task_releases_and_disconnects() {
    let mut h = harness();
    let task = h
        .registry
        .create(|| async { Ok(TaskInfo::finished("s1")) });
    h.registry.run(&task).await.unwrap();

    let subscribe = h.outbound.recv().await.unwrap();
    assert_eq!(subscribe.id, "cb_client_topic_subscribe");
    assert_eq!(subscribe.topic_id, "cb_session_task");

    h.registry.remove(task.id()).await.unwrap();
    assert!(h.registry.is_empty());
    assert!(!h.registry.is_connected());
    assert!(h.registry.get("s1").is_none());
    assert_eq!(*h.api.fetches.lock(), vec![("s1".to_string(), true)]);

    let unsubscribe = tokio::time::timeout(Duration::from_secs(1), h.outbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unsubscribe.id, "cb_client_topic_unsubscribe");

    h.registry.remove("s1").await.unwrap();
}

#[tokio::test]
async fn stray_events_are_dropped_with_the_last_task() {
    let h = harness();
    h.api.set(TaskInfo::finished("s1"));
    h.api.set(TaskInfo::finished("s2"));
    let first = h
        .registry
        .create(|| async { Ok(TaskInfo::finished("s1")) });
    let second = h
        .registry
        .create(|| async { Ok(TaskInfo::finished("s2")) });
    h.registry.run(&first).await.unwrap();
    h.registry.run(&second).await.unwrap();

    push(&h.source, "never-created", true, Some("Executing"));
    eventually("stray event buffered", || h.registry.buffered_event_count() == 1).await;

    h.registry.remove(first.id()).await.unwrap();
    assert_eq!(h.registry.buffered_event_count(), 1);

    h.registry.remove(second.id()).await.unwrap();
    assert!(h.registry.is_empty());
    assert_eq!(h.registry.buffered_event_count(), 0);
}

#[tokio::test]
async fn failed_release_is_not_an_error() {
    let h = harness();
    let task = h
        .registry
        .create(|| async { Ok(TaskInfo::finished("s1")) });
    h.registry.run(&task).await.unwrap();

    // The mock does not know "s1", so the release request fails.
    h.registry.remove(task.id()).await.unwrap();
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn dispose_stops_event_routing() {
    let h = harness();
    let _task = h
        .registry
        .create(|| async { Ok(TaskInfo::running("s1", "queued")) });
    h.registry.dispose();
    assert!(!h.registry.is_connected());

    push(&h.source, "zz", true, None);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.registry.buffered_event_count(), 0);
}
