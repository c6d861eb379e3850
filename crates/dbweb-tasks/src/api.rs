use async_trait::async_trait;

use dbweb_core::TaskInfo;

use crate::error::TaskError;

/// Request/response side of the server task API.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Fetch the current status of `task_id`. With `remove_on_finish` the
    /// server releases the task once it has finished.
    async fn get_task_info(&self, task_id: &str, remove_on_finish: bool)
    -> Result<TaskInfo, TaskError>;

    async fn cancel_task(&self, task_id: &str) -> Result<(), TaskError>;
}
