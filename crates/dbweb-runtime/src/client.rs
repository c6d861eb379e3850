//! ClientRuntime: explicit wiring of the event source, topic handlers and
//! the task registry.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use dbweb_core::{ServerEvent, TaskInfo};
use dbweb_events::{
    ConnectionStateEventHandler, EventSource, SessionEventSource, TaskInfoEventHandler,
    TopicEventHandler,
};
use dbweb_tasks::{AsyncTaskRegistry, TaskApi, TaskError};

use crate::config::ClientConfig;

pub struct ClientRuntime {
    pub source: Arc<SessionEventSource>,
    pub task_events: TaskInfoEventHandler,
    pub connection_events: ConnectionStateEventHandler,
    pub tasks: Arc<AsyncTaskRegistry>,
}

impl ClientRuntime {
    /// Build the runtime. The returned receiver yields client events the
    /// transport must forward to the server.
    pub fn new(config: &ClientConfig, api: Arc<dyn TaskApi>) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (source, outbound) =
            SessionEventSource::new(config.events.channel_capacity, config.events.outbound_capacity);
        let source = Arc::new(source);
        let shared: Arc<dyn EventSource> = source.clone();

        let task_events = TopicEventHandler::task_info(Arc::clone(&shared));
        let connection_events = TopicEventHandler::connection_state(shared);
        let tasks = AsyncTaskRegistry::new(api, task_events.clone(), config.task_config());

        let runtime = Self {
            source,
            task_events,
            connection_events,
            tasks,
        };
        (runtime, outbound)
    }

    pub fn shutdown(&self) {
        self.tasks.dispose();
    }

    /// No tracked tasks and no open task topic connection.
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty() && !self.task_events.is_connected()
    }
}

/// Task API used when no server is attached: every request fails.
pub struct OfflineTaskApi;

#[async_trait]
impl TaskApi for OfflineTaskApi {
    async fn get_task_info(&self, task_id: &str, _remove_on_finish: bool) -> Result<TaskInfo, TaskError> {
        Err(TaskError::Api(format!("no server attached, can't fetch task {task_id}")))
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), TaskError> {
        Err(TaskError::Api(format!("no server attached, can't cancel task {task_id}")))
    }
}
