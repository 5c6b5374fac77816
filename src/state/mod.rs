//! Durable progress tracking.
//!
//! SQLite-backed store for:
//! - per-item lifecycle state (course, tab, file)
//! - the singleton aggregate of the current sync run
//! - the user's persisted selection keys
//!
//! plus the [`RunLock`] that keeps two runs from driving it at once.

pub mod db;
pub mod error;
pub mod lock;
pub mod schema;
pub mod types;

pub use db::{ProgressStore, SqliteProgressStore};
pub use error::StateError;
pub use lock::RunLock;
pub use types::{
    AggregateProgressRecord, ItemSelection, StateCounts, StateProgressRecord,
    FILE_DOWNLOAD_FAILED,
};
