use ib_crypto::ChunkLengthError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Attachment file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("{what} already set for {record}")]
    AlreadySet { what: &'static str, record: String },

    #[error("Message {0} already stored")]
    AlreadyExists(String),

    #[error("Message {0} already processed")]
    AlreadyProcessed(String),

    #[error("Message {0} cannot be deleted yet")]
    DeletePrecondition(String),

    #[error("Chunk of {len} bytes overflows attachment {record}: {received}/{expected} received")]
    Overflow {
        record: String,
        len: i64,
        received: i64,
        expected: i64,
    },

    #[error("Chunk arithmetic error: {0}")]
    ChunkLength(#[from] ChunkLengthError),
}

impl StoreError {
    /// Transient failures the caller may retry with a fresh unit of work.
    /// Everything else is a caller contract violation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Io(_))
    }
}
