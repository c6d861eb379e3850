//! dbweb-core: wire types shared by the event, task and tab layers.
//! Server event envelopes, session topics, task status payloads and the
//! synchronous notification primitive every stateful entity exposes.
//! No IO, no async.

pub mod error;
pub mod executor;
pub mod types;

pub use error::CoreError;
pub use executor::{HandlerId, SyncExecutor};
pub use types::{
    ClientEventId, Envelope, ServerError, ServerEvent, ServerEventId, SessionEventTopic, TaskInfo,
    TopicEvent, WsTaskInfo,
};
