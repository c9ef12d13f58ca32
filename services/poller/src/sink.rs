//! Record sinks: where parsed batches go.
//!
//! Two interchangeable sinks behind one closed variant — a local SQLite
//! staging buffer (drained by a separate mover) and a direct relational
//! sink. `insert` returning `Ok(true)` means the batch is durably accepted
//! downstream; only then may watermarks advance.

pub mod buffer;
pub mod pg;

use meter_core::{BatchKey, Record};
use thiserror::Error;

pub use buffer::BufferSink;
pub use pg::PgSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink rejected batch: {0}")]
    Rejected(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres: {0}")]
    Pg(#[from] sqlx::Error),
    #[error("payload serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

/// The configured record sink.
pub enum RecordSink {
    Buffer(BufferSink),
    Postgres(PgSink),
}

impl RecordSink {
    /// Ship one batch. `Ok(true)` confirms durable acceptance.
    pub async fn insert(&self, key: &BatchKey, records: &[Record]) -> Result<bool, SinkError> {
        match self {
            RecordSink::Buffer(sink) => sink.insert(key, records).await,
            RecordSink::Postgres(sink) => sink.insert(key, records).await,
        }
    }
}
