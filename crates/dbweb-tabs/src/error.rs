use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("tab with key {0:?} already exists")]
    DuplicateKey(String),

    #[error("tab state serialization failed: {0}")]
    State(#[from] serde_json::Error),
}
