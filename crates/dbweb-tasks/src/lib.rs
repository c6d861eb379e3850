//! dbweb-tasks: tracking of long-running server tasks.
//!
//! [`AsyncTask`] reconciles push status events with polled snapshots for a
//! single task; [`AsyncTaskRegistry`] owns the tracked tasks, maps server
//! ids to local ids and keeps the task status topic open while any task is
//! tracked.

pub mod api;
pub mod config;
pub mod error;
pub mod registry;
pub mod task;

pub use api::TaskApi;
pub use config::{DEFAULT_INIT_RETRY_DELAY, TaskConfig};
pub use error::TaskError;
pub use registry::AsyncTaskRegistry;
pub use task::{AsyncTask, CancelFn, TaskFuture, TaskOutcome};
