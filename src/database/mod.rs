pub mod batch;
pub mod cleanup;
pub mod client;
pub mod migrations;
pub mod models;
pub mod partition;
pub mod queries;

pub use batch::{BatchRecorder, BatchWriter, DeadLetter, DeadLetterQueue, RecorderStats};
pub use cleanup::{RetentionManager, RetentionReport};
pub use client::TimeSeriesDb;
pub use migrations::{MigrationRunner, MigrationStatus};
pub use models::*;
pub use partition::{PartitionGranularity, Table};

/// Database errors
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    #[error("Query execution failed: {0}")]
    QueryError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Service initialization failed: {0}")]
    InitializationError(String),

    #[error("SQLite error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}
