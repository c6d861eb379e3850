//! In-process session event source.
//!
//! Frames received by the transport are decoded and fanned out over a
//! broadcast channel; each `multiplex` stream filters its own topic. The
//! source tracks how many streams are open per topic and asks the server to
//! start or stop pushing that topic (client subscribe/unsubscribe events) on
//! the 0→1 and 1→0 transitions.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{StreamExt, future, stream};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use dbweb_core::{ClientEventId, ServerEvent, ServerEventId, SyncExecutor};

use crate::error::EventError;
use crate::source::{EventSource, EventStream};

/// Default capacity of the inbound broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default capacity of the outbound (client → transport) queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

pub struct SessionEventSource {
    inbound: broadcast::Sender<ServerEvent>,
    capacity: usize,
    topics: Arc<TopicRefs>,
    on_init: SyncExecutor<()>,
}

impl SessionEventSource {
    /// Create a source and the receiver the transport drains to deliver
    /// client events to the server.
    pub fn new(
        channel_capacity: usize,
        outbound_capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let capacity = channel_capacity.max(1);
        let (inbound, _) = broadcast::channel(capacity);
        let (outbound, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        let source = Self {
            inbound,
            capacity,
            topics: Arc::new(TopicRefs {
                counts: Mutex::new(HashMap::new()),
                outbound,
            }),
            on_init: SyncExecutor::new(),
        };
        (source, outbound_rx)
    }

    /// Deliver one server event to every open stream.
    ///
    /// Returns the number of streams that received it. A socket-connected
    /// event additionally re-announces open topics and fires `on_init`.
    pub fn ingest(&self, event: ServerEvent) -> usize {
        let reconnected = event.id == ServerEventId::SessionWebsocketConnected.as_str();
        let delivered = match self.inbound.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!(id = %event.id, topic = %event.topic_id, "no open streams for event");
                0
            }
        };
        if reconnected {
            self.reinitialize();
        }
        delivered
    }

    /// Decode a raw JSON frame and ingest it.
    pub fn ingest_frame(&self, frame: &str) -> Result<usize, EventError> {
        let event = ServerEvent::from_frame(frame)?;
        Ok(self.ingest(event))
    }

    /// Re-send subscriptions for every open topic and notify `on_init`
    /// listeners. Called after the transport reconnects.
    pub fn reinitialize(&self) {
        for topic in self.subscribed_topics() {
            if let Err(e) = self
                .topics
                .send(ServerEvent::client(ClientEventId::TopicSubscribe, &topic))
            {
                warn!(topic = %topic, "failed to re-announce topic subscription: {e}");
            }
        }
        self.on_init.execute(&());
    }

    /// Inbound backlog a stream may fall behind by before it starts losing
    /// events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Topics with at least one open stream, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.counts.lock().keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl EventSource for SessionEventSource {
    fn multiplex(&self, topic: &str) -> EventStream<ServerEvent> {
        let rx = self.inbound.subscribe();
        let guard = TopicRefs::acquire(&self.topics, topic);
        let wanted = topic.to_owned();

        let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, (rx, guard))),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %guard.topic, skipped, "session event stream lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Box::pin(events.filter(move |event| future::ready(event.topic_id == wanted)))
    }

    fn emit(&self, event: ServerEvent) -> Result<(), EventError> {
        self.topics.send(event)
    }

    fn on_init(&self) -> &SyncExecutor<()> {
        &self.on_init
    }
}

// ─── Topic reference counting ─────────────────────────────────────

struct TopicRefs {
    counts: Mutex<HashMap<String, usize>>,
    outbound: mpsc::Sender<ServerEvent>,
}

impl TopicRefs {
    fn acquire(refs: &Arc<Self>, topic: &str) -> TopicGuard {
        let mut counts = refs.counts.lock();
        let count = counts.entry(topic.to_owned()).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!(topic, "subscribing to topic");
            if let Err(e) = refs.send(ServerEvent::client(ClientEventId::TopicSubscribe, topic)) {
                warn!(topic, "failed to send topic subscription: {e}");
            }
        }
        TopicGuard {
            refs: Arc::clone(refs),
            topic: topic.to_owned(),
        }
    }

    fn release(&self, topic: &str) {
        let mut counts = self.counts.lock();
        let Some(count) = counts.get_mut(topic) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            counts.remove(topic);
            debug!(topic, "unsubscribing from topic");
            if let Err(e) = self.send(ServerEvent::client(ClientEventId::TopicUnsubscribe, topic)) {
                warn!(topic, "failed to send topic unsubscription: {e}");
            }
        }
    }

    fn send(&self, event: ServerEvent) -> Result<(), EventError> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => EventError::TransportFull { id: event.id },
            mpsc::error::TrySendError::Closed(_) => EventError::TransportClosed,
        })
    }
}

/// Held by each open multiplex stream; releases the topic on drop.
struct TopicGuard {
    refs: Arc<TopicRefs>,
    topic: String,
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        self.refs.release(&self.topic);
    }
}
