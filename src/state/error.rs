//! Error types for the progress stores.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during progress store operations.
#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Database query failed: {0}")]
    Query(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// A selection key that does not name a course.
    #[error("Invalid selection key '{0}'")]
    InvalidKey(String),

    /// Another process holds the run lock.
    #[error("Another course-sync run is active (lock: {path})")]
    Busy { path: PathBuf },

    #[error("Failed to create lock file {path}: {source}")]
    LockFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A stored row could not be decoded.
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StateError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
