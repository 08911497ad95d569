//! Durable offline persistence for conversation histories, the conversation
//! index, small account values and attachment files.

mod backend;
mod classify;
mod offline_store;

use thiserror::Error;

pub use backend::{KeyValueBackend, MemoryBackend, SqliteBackend};
pub use classify::{AttachmentClassifier, FileClass, MagicBytesClassifier};
pub use offline_store::OfflineStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("storage migration failure: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored value is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("attachment io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("attachment payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}
