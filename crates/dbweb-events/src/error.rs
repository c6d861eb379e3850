//! Error types for the event layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event transport closed")]
    TransportClosed,

    #[error("event transport backlog full, dropped {id:?}")]
    TransportFull { id: String },

    #[error(transparent)]
    Decode(#[from] dbweb_core::CoreError),
}
