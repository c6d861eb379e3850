use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ─── Topics & Event Kinds ─────────────────────────────────────────

/// Channels the session event stream is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEventTopic {
    /// Long-running server task status.
    #[serde(rename = "cb_session_task")]
    SessionTask,
    /// Datasource connect/disconnect notifications.
    #[serde(rename = "cb_datasource_connection")]
    DatasourceConnection,
    /// Session lifecycle (socket connected, expiry).
    #[serde(rename = "cb_session")]
    Session,
}

impl SessionEventTopic {
    pub const ALL: [Self; 3] = [Self::SessionTask, Self::DatasourceConnection, Self::Session];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionTask => "cb_session_task",
            Self::DatasourceConnection => "cb_datasource_connection",
            Self::Session => "cb_session",
        }
    }
}

impl fmt::Display for SessionEventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionEventTopic {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| CoreError::Unknown {
                kind: "topic",
                value: s.to_owned(),
            })
    }
}

/// Event kinds pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ServerEventId {
    SessionTaskInfoUpdated,
    DatasourceConnected,
    DatasourceDisconnected,
    SessionWebsocketConnected,
}

impl ServerEventId {
    pub const ALL: [Self; 4] = [
        Self::SessionTaskInfoUpdated,
        Self::DatasourceConnected,
        Self::DatasourceDisconnected,
        Self::SessionWebsocketConnected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionTaskInfoUpdated => "cb_session_task_info_updated",
            Self::DatasourceConnected => "cb_datasource_connected",
            Self::DatasourceDisconnected => "cb_datasource_disconnected",
            Self::SessionWebsocketConnected => "cb_session_websocket_connected",
        }
    }
}

impl fmt::Display for ServerEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerEventId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| CoreError::Unknown {
                kind: "server event",
                value: s.to_owned(),
            })
    }
}

/// Event kinds the client sends back over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventId {
    TopicSubscribe,
    TopicUnsubscribe,
}

impl ClientEventId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TopicSubscribe => "cb_client_topic_subscribe",
            Self::TopicUnsubscribe => "cb_client_topic_unsubscribe",
        }
    }
}

impl fmt::Display for ClientEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Envelopes ────────────────────────────────────────────────────

/// Anything routed through a topic handler carries its event kind.
pub trait TopicEvent {
    fn event_id(&self) -> &str;
}

/// Raw server event as it appears on the wire.
///
/// One JSON object per frame: `id` and `topicId` are top-level fields and
/// everything else is payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEvent {
    pub id: String,
    #[serde(default)]
    pub topic_id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ServerEvent {
    pub fn new(id: impl Into<String>, topic_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic_id: topic_id.into(),
            payload: Map::new(),
        }
    }

    /// Client-originated event for `topic`.
    pub fn client(id: ClientEventId, topic_id: impl Into<String>) -> Self {
        Self::new(id.as_str(), topic_id)
    }

    /// Build an event whose payload fields come from `payload`, which must
    /// serialize to a JSON object.
    pub fn encode<P: Serialize>(
        id: impl Into<String>,
        topic_id: impl Into<String>,
        payload: &P,
    ) -> Result<Self, CoreError> {
        let id = id.into();
        let value = serde_json::to_value(payload).map_err(|source| CoreError::Payload {
            id: id.clone(),
            source,
        })?;
        match value {
            Value::Object(payload) => Ok(Self {
                id,
                topic_id: topic_id.into(),
                payload,
            }),
            other => Err(CoreError::Payload {
                id,
                source: <serde_json::Error as serde::de::Error>::custom(format!(
                    "payload must be a JSON object, got {other}"
                )),
            }),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn from_frame(frame: &str) -> Result<Self, CoreError> {
        serde_json::from_str(frame).map_err(CoreError::InvalidFrame)
    }

    pub fn to_frame(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(CoreError::InvalidFrame)
    }

    /// Decode the payload into a typed envelope.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<Envelope<P>, CoreError> {
        let payload = serde_json::from_value(Value::Object(self.payload.clone())).map_err(
            |source| CoreError::Payload {
                id: self.id.clone(),
                source,
            },
        )?;
        Ok(Envelope {
            id: self.id.clone(),
            topic_id: self.topic_id.clone(),
            payload,
        })
    }
}

impl TopicEvent for ServerEvent {
    fn event_id(&self) -> &str {
        &self.id
    }
}

/// Server event with a decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<P> {
    pub id: String,
    pub topic_id: String,
    pub payload: P,
}

impl<P> TopicEvent for Envelope<P> {
    fn event_id(&self) -> &str {
        &self.id
    }
}

// ─── Task Status ──────────────────────────────────────────────────

/// Error reported by the server for a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            stack_trace: None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Full status snapshot returned by the task status API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub running: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_result: Option<Value>,
}

impl TaskInfo {
    pub fn running(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            running: true,
            status: Some(status.into()),
            error: None,
            task_result: None,
        }
    }

    pub fn finished(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            running: false,
            status: Some("Finished".to_owned()),
            error: None,
            task_result: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: ServerError) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            running: false,
            status: Some("Failed".to_owned()),
            error: Some(error),
            task_result: None,
        }
    }
}

/// Status push payload on the `cb_session_task` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsTaskInfo {
    pub task_id: String,
    #[serde(default)]
    pub status_name: Option<String>,
    pub running: bool,
}
