//! Error types for wire decoding.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid event frame: {0}")]
    InvalidFrame(#[source] serde_json::Error),

    #[error("failed to decode payload of event {id:?}: {source}")]
    Payload {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown {kind}: {value}")]
    Unknown { kind: &'static str, value: String },
}
