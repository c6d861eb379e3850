//! AsyncTaskRegistry: owns in-flight tasks and routes task status events.
//!
//! Tasks are keyed by their local id. The server id becomes known only when
//! the first snapshot arrives, so push events for a server id the registry
//! has not aliased yet are buffered (last write wins) and replayed once the
//! alias is recorded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use dbweb_core::{Envelope, ServerEventId, TaskInfo, WsTaskInfo};
use dbweb_events::{Connection, Subscription, TaskInfoEventHandler};

use crate::api::TaskApi;
use crate::config::TaskConfig;
use crate::error::TaskError;
use crate::task::{AsyncTask, CancelFn, TaskOutcome};

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<String, AsyncTask>,
    aliases: HashMap<String, String>,
    pending_events: HashMap<String, WsTaskInfo>,
    connection: Option<Connection>,
}

impl RegistryState {
    /// Look up by local id, then by server id alias.
    fn find(&self, task_id: &str) -> Option<AsyncTask> {
        self.tasks
            .get(task_id)
            .or_else(|| {
                self.aliases
                    .get(task_id)
                    .and_then(|local| self.tasks.get(local))
            })
            .cloned()
    }
}

pub struct AsyncTaskRegistry {
    api: Arc<dyn TaskApi>,
    events: TaskInfoEventHandler,
    config: TaskConfig,
    state: Mutex<RegistryState>,
    subscription: Mutex<Option<Subscription>>,
    this: Weak<Self>,
}

impl AsyncTaskRegistry {
    pub fn new(
        api: Arc<dyn TaskApi>,
        events: TaskInfoEventHandler,
        config: TaskConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let weak = this.clone();
            let subscription = events.on_event(
                ServerEventId::SessionTaskInfoUpdated.as_str(),
                |event: &Envelope<WsTaskInfo>| event.payload.clone(),
                move |info| {
                    if let Some(registry) = weak.upgrade() {
                        registry.handle_event(info);
                    }
                },
                None,
            );

            Self {
                api,
                events,
                config,
                state: Mutex::new(RegistryState::default()),
                subscription: Mutex::new(Some(subscription)),
                this: this.clone(),
            }
        })
    }

    /// Create and track a task whose initiating request is `init`.
    ///
    /// The first tracked task opens the task status topic connection.
    pub fn create<I, Fut>(&self, init: I) -> AsyncTask
    where
        I: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<TaskInfo, TaskError>> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let cancel: CancelFn = Arc::new(move |server_id: String| {
            let api = Arc::clone(&api);
            async move { api.cancel_task(&server_id).await }.boxed()
        });
        let task = AsyncTask::new(init, cancel, &self.config);

        let aliased = AtomicBool::new(false);
        let weak = self.this.clone();
        let local_id = task.id().to_owned();
        task.on_status_change().add_handler(move |info: &TaskInfo| {
            if aliased.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(registry) = weak.upgrade() {
                registry.register_alias(&info.id, &local_id);
            }
        });

        let mut state = self.state.lock();
        state.tasks.insert(task.id().to_owned(), task.clone());
        if state.connection.is_none() {
            debug!(topic = self.events.topic(), "opening task status connection");
            state.connection = Some(self.events.connect());
        }
        task
    }

    /// Run `task` if it has not been initialized yet and wait for it to
    /// settle.
    pub async fn run(&self, task: &AsyncTask) -> TaskOutcome {
        if task.info().is_none() {
            task.run().await?;
        }
        task.outcome().await
    }

    /// Stop tracking a finished task and ask the server to release it.
    ///
    /// Fails without touching any state if the task is still pending. Unknown
    /// ids are ignored.
    pub async fn remove(&self, task_id: &str) -> Result<(), TaskError> {
        let (server_id, connection) = {
            let mut state = self.state.lock();
            let Some(task) = state.find(task_id) else {
                return Ok(());
            };
            if task.pending() {
                return Err(TaskError::StillPending(task.id().to_owned()));
            }

            state.tasks.remove(task.id());
            let server_id = task.server_id();
            if let Some(server_id) = &server_id {
                state.aliases.remove(server_id);
                state.pending_events.remove(server_id);
            }
            let connection = if state.tasks.is_empty() {
                // Nothing left that could claim a buffered event.
                state.pending_events.clear();
                state.connection.take()
            } else {
                None
            };
            (server_id, connection)
        };

        if let Some(connection) = connection {
            debug!(topic = self.events.topic(), "closing task status connection");
            connection.close();
        }

        if let Some(server_id) = server_id {
            if let Err(e) = self.api.get_task_info(&server_id, true).await {
                warn!(task = %server_id, "failed to release finished task: {e}");
            }
        }
        Ok(())
    }

    /// Cancel by local or server id. Unknown ids are ignored.
    pub async fn cancel(&self, task_id: &str) -> Result<(), TaskError> {
        let task = self.state.lock().find(task_id);
        match task {
            Some(task) => task.cancel_async().await,
            None => Ok(()),
        }
    }

    /// Look up by local or server id.
    pub fn get(&self, task_id: &str) -> Option<AsyncTask> {
        self.state.lock().find(task_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }

    /// Events waiting for their task's alias.
    pub fn buffered_event_count(&self) -> usize {
        self.state.lock().pending_events.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    /// Detach from the event handler and close the topic connection.
    pub fn dispose(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        let connection = self.state.lock().connection.take();
        drop(connection);
    }

    /// Route a pushed status update to its task, or buffer it until the task
    /// is aliased.
    pub fn handle_event(&self, event: WsTaskInfo) {
        let task = {
            let mut state = self.state.lock();
            match state.find(&event.task_id) {
                Some(task) => task,
                None => {
                    trace!(task = %event.task_id, "buffering event for unknown task");
                    state.pending_events.insert(event.task_id.clone(), event);
                    return;
                }
            }
        };
        self.dispatch_update(task, event);
    }

    fn register_alias(&self, server_id: &str, local_id: &str) {
        let (task, pending) = {
            let mut state = self.state.lock();
            state
                .aliases
                .insert(server_id.to_owned(), local_id.to_owned());
            let pending = state.pending_events.remove(server_id);
            (state.tasks.get(local_id).cloned(), pending)
        };
        debug!(task = %local_id, server_id, "task alias registered");

        if let (Some(task), Some(event)) = (task, pending) {
            debug!(server_id, "replaying buffered task event");
            self.dispatch_update(task, event);
        }
    }

    /// Finished tasks get a full refetch; running ones a status patch.
    fn dispatch_update(&self, task: AsyncTask, event: WsTaskInfo) {
        if event.running {
            task.update_status(&event);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(task = %event.task_id, "no tokio runtime, dropping task refresh");
            return;
        };
        let api = Arc::clone(&self.api);
        runtime.spawn(async move {
            let server_id = event.task_id;
            let result = task
                .update_info_async(|| {
                    let server_id = server_id.clone();
                    async move { api.get_task_info(&server_id, false).await }
                })
                .await;
            if let Err(e) = result {
                warn!(task = %server_id, "task refresh failed: {e}");
            }
        });
    }
}

impl Drop for AsyncTaskRegistry {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.unsubscribe();
        }
    }
}
