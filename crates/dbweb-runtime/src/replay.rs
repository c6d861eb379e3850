//! `dbweb replay`: route a captured frame log through the event layer.
//!
//! Each line of the log is one JSON server event. Frames are ingested into
//! the runtime's session source and counted on the receiving side by one raw
//! handler per topic, so the summary reflects what listeners actually saw.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use dbweb_core::{ServerEvent, ServerEventId, SessionEventTopic};
use dbweb_events::{
    Connection, ConnectionStateEvent, ConnectionStatePayload, EventSource, Subscription,
    TopicEventHandler,
};

use crate::client::ClientRuntime;

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub frames: usize,
    pub malformed: usize,
    pub filtered_out: usize,
    /// Delivered events per topic, by event id.
    pub topics: BTreeMap<String, BTreeMap<String, usize>>,
    /// Datasource connections left open at the end of the log.
    pub open_connections: BTreeSet<String>,
    pub subscribed_topics: Vec<String>,
}

type Counts = Arc<Mutex<BTreeMap<String, usize>>>;

struct TopicCounter {
    topic: String,
    _handler: TopicEventHandler<ServerEvent>,
    counts: Counts,
    subscription: Subscription,
    _connection: Connection,
}

impl TopicCounter {
    fn attach(topic: &str, source: Arc<dyn EventSource>) -> Self {
        let handler = TopicEventHandler::raw(topic, source);
        let counts: Counts = Arc::default();
        let sink = Arc::clone(&counts);
        let subscription = handler.on(
            |_| true,
            |event: &ServerEvent| event.id.clone(),
            move |id| *sink.lock().entry(id).or_insert(0) += 1,
            None,
        );
        let connection = handler.connect();
        Self {
            topic: topic.to_owned(),
            _handler: handler,
            counts,
            subscription,
            _connection: connection,
        }
    }

    fn delivered(&self) -> usize {
        self.counts.lock().values().sum()
    }
}

fn is_connection_event(event: &ServerEvent) -> bool {
    event.topic_id == SessionEventTopic::DatasourceConnection.as_str()
        && matches!(
            event.id.parse::<ServerEventId>(),
            Ok(ServerEventId::DatasourceConnected | ServerEventId::DatasourceDisconnected)
        )
        && event.decode::<ConnectionStatePayload>().is_ok()
}

/// Replay `path` through `runtime`, restricted to `topic` when given.
pub async fn run(
    runtime: &ClientRuntime,
    path: &Path,
    topic: Option<&str>,
    timeout: Duration,
) -> anyhow::Result<ReplaySummary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read frame log {}", path.display()))?;

    let topics: Vec<String> = match topic {
        Some(topic) => vec![topic.to_owned()],
        None => SessionEventTopic::ALL
            .iter()
            .map(|t| t.as_str().to_owned())
            .collect(),
    };
    let shared: Arc<dyn EventSource> = runtime.source.clone();
    let counters: Vec<TopicCounter> = topics
        .iter()
        .map(|topic| TopicCounter::attach(topic, Arc::clone(&shared)))
        .collect();

    let watch_connections = topics
        .iter()
        .any(|t| t == SessionEventTopic::DatasourceConnection.as_str());
    let open_connections: Arc<Mutex<BTreeSet<String>>> = Arc::default();
    let connection_updates = Arc::new(AtomicUsize::new(0));
    let connection_sub = {
        let open = Arc::clone(&open_connections);
        let seen = Arc::clone(&connection_updates);
        runtime.connection_events.on(
            |_| true,
            |event: &ConnectionStateEvent| event.clone(),
            move |event| {
                let mut open = open.lock();
                match event {
                    ConnectionStateEvent::Connected(p) => open.extend(p.connection_ids),
                    ConnectionStateEvent::Disconnected(p) => {
                        for id in &p.connection_ids {
                            open.remove(id);
                        }
                    }
                }
                seen.fetch_add(1, Ordering::SeqCst);
            },
            None,
        )
    };
    let connection_hold = watch_connections.then(|| runtime.connection_events.connect());

    let mut summary = ReplaySummary::default();
    let mut expected = 0usize;
    let mut expected_connection_updates = 0usize;
    let backlog_limit = (runtime.source.capacity() / 2).max(1);
    let outstanding = |expected: usize, expected_updates: usize| {
        (expected - delivered(&counters))
            + expected_updates.saturating_sub(connection_updates.load(Ordering::SeqCst))
    };

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        summary.frames += 1;

        let event = match ServerEvent::from_frame(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no + 1, "skipping malformed frame: {e}");
                summary.malformed += 1;
                continue;
            }
        };
        if !topics.iter().any(|t| *t == event.topic_id) {
            summary.filtered_out += 1;
            continue;
        }

        if watch_connections && is_connection_event(&event) {
            expected_connection_updates += 1;
        }
        expected += 1;
        runtime.source.ingest(event);

        // Keep the broadcast backlog well under capacity so no receiver lags.
        while outstanding(expected, expected_connection_updates) >= backlog_limit {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    let drained = tokio::time::timeout(timeout, async {
        while outstanding(expected, expected_connection_updates) > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    if drained.is_err() {
        bail!(
            "timed out after {timeout:?}: {} of {expected} events delivered",
            delivered(&counters)
        );
    }

    summary.subscribed_topics = runtime.source.subscribed_topics();
    summary.open_connections = open_connections.lock().clone();
    for counter in counters {
        counter.subscription.unsubscribe();
        debug!(topic = %counter.topic, "replay counter detached");
        let counts = counter.counts.lock().clone();
        if !counts.is_empty() {
            summary.topics.insert(counter.topic, counts);
        }
    }
    connection_sub.unsubscribe();
    drop(connection_hold);

    info!(
        frames = summary.frames,
        malformed = summary.malformed,
        delivered = expected,
        "replay finished"
    );
    Ok(summary)
}

fn delivered(counters: &[TopicCounter]) -> usize {
    counters.iter().map(TopicCounter::delivered).sum()
}
