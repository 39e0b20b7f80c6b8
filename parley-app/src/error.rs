use parley_llm::LlmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("turn cancelled")]
    Cancelled,

    #[error("conversation actor is no longer running")]
    ActorClosed,
}
