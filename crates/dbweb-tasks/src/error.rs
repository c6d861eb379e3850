use thiserror::Error;

use dbweb_core::ServerError;

/// Errors surfaced by tasks and the task registry.
///
/// `Clone` so a settled outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task failed on server: {0}")]
    Server(ServerError),

    #[error("task was cancelled")]
    Cancelled,

    #[error("can't cancel finished task")]
    NotPending,

    #[error("can't remove unfinished task {0}")]
    StillPending(String),

    #[error("task api error: {0}")]
    Api(String),

    #[error("task initialization was abandoned before completing")]
    Abandoned,
}
