//! dbweb-events: topic-scoped server event plumbing.
//!
//! A single [`SessionEventSource`] fans transport frames out per topic.
//! [`TopicEventHandler`]s sit on top of it, keep a long-lived listener list
//! and open the underlying topic stream only while a registered resource is
//! in use or an explicit [`Connection`] is held.

pub mod error;
pub mod handlers;
pub mod session;
pub mod source;
pub mod topic;
pub mod usage;

pub use error::EventError;
pub use handlers::{
    ConnectionStateEvent, ConnectionStateEventHandler, ConnectionStatePayload,
    TaskInfoEventHandler,
};
pub use session::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_OUTBOUND_CAPACITY, SessionEventSource};
pub use source::{EventSource, EventStream};
pub use topic::{Connection, Subscription, TopicEventHandler};
pub use usage::{ResourceUsage, UseTracker};
