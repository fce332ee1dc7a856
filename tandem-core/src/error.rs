//! Error types for the document and capture layers.

use thiserror::Error;

use crate::id::StructuralId;

/// Failures raised by Document implementations.
#[derive(Debug, Clone, Error)]
pub enum DocError {
    #[error("malformed state vector: {0}")]
    StateVector(String),
    #[error("malformed update: {0}")]
    Update(String),
    #[error("unknown structural id {0}")]
    UnknownItem(StructuralId),
}

/// Persistence collaborator failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("record not found: {0}")]
    NotFound(u64),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

/// Failures raised by `OpCapture`.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// The capture was used after `destroy()`.
    #[error("op capture already destroyed")]
    Destroyed,
    #[error("origin codec error: {0}")]
    Codec(String),
    #[error("malformed log entry: {0}")]
    MalformedEntry(String),
    /// A store was configured outside of a tokio runtime.
    #[error("persistence requires a running tokio runtime")]
    NoRuntime,
    #[error("persistence task stopped")]
    PersistenceClosed,
    /// `restore_from_store` on a capture built without a store.
    #[error("no op store configured")]
    NoStore,
    #[error(transparent)]
    Store(#[from] StoreError),
}
