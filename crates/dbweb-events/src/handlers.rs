//! Concrete topic handlers used by the client.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use dbweb_core::{
    Envelope, ServerEvent, ServerEventId, SessionEventTopic, TopicEvent, WsTaskInfo,
};

use crate::source::EventSource;
use crate::topic::TopicEventHandler;

pub type TaskInfoEventHandler = TopicEventHandler<Envelope<WsTaskInfo>>;
pub type ConnectionStateEventHandler = TopicEventHandler<ConnectionStateEvent>;

fn decode_logged<P: DeserializeOwned>(event: ServerEvent) -> Option<Envelope<P>> {
    match event.decode() {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!(id = %event.id, topic = %event.topic_id, "dropping malformed event: {e}");
            None
        }
    }
}

impl TopicEventHandler<Envelope<WsTaskInfo>> {
    /// Handler for `cb_session_task`, yielding task status updates.
    pub fn task_info(source: Arc<dyn EventSource>) -> Self {
        Self::new(SessionEventTopic::SessionTask.as_str(), source, |event| {
            if event.id != ServerEventId::SessionTaskInfoUpdated.as_str() {
                trace!(id = %event.id, "ignoring non task-info event");
                return None;
            }
            decode_logged(event)
        })
    }
}

// ─── Datasource connection state ──────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatePayload {
    #[serde(default)]
    pub connection_ids: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStateEvent {
    Connected(ConnectionStatePayload),
    Disconnected(ConnectionStatePayload),
}

impl ConnectionStateEvent {
    pub fn payload(&self) -> &ConnectionStatePayload {
        match self {
            Self::Connected(p) | Self::Disconnected(p) => p,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

impl TopicEvent for ConnectionStateEvent {
    fn event_id(&self) -> &str {
        match self {
            Self::Connected(_) => ServerEventId::DatasourceConnected.as_str(),
            Self::Disconnected(_) => ServerEventId::DatasourceDisconnected.as_str(),
        }
    }
}

impl TopicEventHandler<ConnectionStateEvent> {
    /// Handler for `cb_datasource_connection`.
    pub fn connection_state(source: Arc<dyn EventSource>) -> Self {
        Self::new(
            SessionEventTopic::DatasourceConnection.as_str(),
            source,
            |event| {
                let connected = match event.id.parse::<ServerEventId>() {
                    Ok(ServerEventId::DatasourceConnected) => true,
                    Ok(ServerEventId::DatasourceDisconnected) => false,
                    _ => return None,
                };
                let envelope = decode_logged::<ConnectionStatePayload>(event)?;
                Some(if connected {
                    ConnectionStateEvent::Connected(envelope.payload)
                } else {
                    ConnectionStateEvent::Disconnected(envelope.payload)
                })
            },
        )
    }
}
