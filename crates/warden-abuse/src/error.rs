//! Error types for the abuse detection engine.

use warden_counters::CounterError;

/// Errors that can occur during abuse detection and mitigation.
#[derive(Debug, thiserror::Error)]
pub enum AbuseError {
    /// A mitigation store operation failed.
    #[error("mitigation database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The counter store failed (after any failover).
    #[error("counter store error: {0}")]
    Counter(#[from] CounterError),

    /// A blocking store task was cancelled or panicked.
    #[error("store task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A stored row held a label no current enum variant matches.
    #[error("corrupt mitigation row {id}: {detail}")]
    CorruptRecord {
        /// The offending row id.
        id: i64,
        /// What failed to parse.
        detail: String,
    },
}
