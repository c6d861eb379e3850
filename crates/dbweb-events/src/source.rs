//! EventSource trait: the transport-facing side of the event layer.

use std::pin::Pin;

use futures_util::Stream;

use dbweb_core::{ServerEvent, SyncExecutor};

use crate::error::EventError;

/// Boxed stream of events handed out by [`EventSource::multiplex`].
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Shared stream of topic-scoped server events.
///
/// Implementations guarantee at-least-once delivery to every live
/// `multiplex` stream while connected. Ordering is FIFO per topic only.
pub trait EventSource: Send + Sync {
    /// Events for `topic` from the moment of the call until the stream is
    /// dropped. Dropping the stream releases the topic subscription.
    fn multiplex(&self, topic: &str) -> EventStream<ServerEvent>;

    /// Send a client-originated event to the transport.
    fn emit(&self, event: ServerEvent) -> Result<(), EventError>;

    /// Fired whenever the transport (re)initializes.
    fn on_init(&self) -> &SyncExecutor<()>;
}
