//! Read-only observation of sync progress.
//!
//! Observers never write. Each call to a `ProgressObserver` method starts a
//! fresh subscription: it yields the current durable snapshot first and then
//! one item per store change, so a UI relaunched mid-run picks up where the
//! store is.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};

use crate::model::{rollup, DownloadState};
use crate::state::{AggregateProgressRecord, ProgressStore, StateError, StateProgressRecord};

pub type ObserverStream<T> = BoxStream<'static, Result<T, StateError>>;

pub trait ProgressObserver: Send + Sync {
    /// Aggregate of the current run; `None` until a run has started.
    fn observe_download_progress(&self) -> ObserverStream<Option<AggregateProgressRecord>>;

    fn observe_state_progress(&self) -> ObserverStream<Vec<StateProgressRecord>>;
}

/// [`ProgressObserver`] backed by the durable store's change counter.
///
/// Writes from another process wake it only while the store runs
/// [`SqliteProgressStore::watch_external_writes`](crate::state::SqliteProgressStore::watch_external_writes).
#[derive(Clone)]
pub struct StoreObserver {
    store: Arc<dyn ProgressStore>,
}

impl StoreObserver {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }
}

impl ProgressObserver for StoreObserver {
    fn observe_download_progress(&self) -> ObserverStream<Option<AggregateProgressRecord>> {
        watch_store(self.store.clone(), |store| async move {
            store.get_download_progress().await
        })
    }

    fn observe_state_progress(&self) -> ObserverStream<Vec<StateProgressRecord>> {
        watch_store(self.store.clone(), |store| async move {
            store.get_state_progress().await
        })
    }
}

/// Re-read the store once up front and again after every change
/// notification. Changes landing during a read trigger one more read.
fn watch_store<T, F, Fut>(store: Arc<dyn ProgressStore>, read: F) -> ObserverStream<T>
where
    T: Send + 'static,
    F: Fn(Arc<dyn ProgressStore>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, StateError>> + Send + 'static,
{
    let changes = store.subscribe();
    stream::unfold(
        (store, changes, read, true),
        |(store, mut changes, read, first)| async move {
            if !first && changes.changed().await.is_err() {
                return None;
            }
            changes.borrow_and_update();
            let item = read(store.clone()).await;
            Some((item, (store, changes, read, false)))
        },
    )
    .boxed()
}

/// Per-course view of the state records, for "course X: 40% (12/30 files)".
#[derive(Debug, Clone, PartialEq)]
pub struct CourseProgressSummary {
    pub course_id: String,
    /// Mean completion of the course's file records.
    pub progress: f64,
    pub downloaded_files: usize,
    pub total_files: usize,
    pub state: DownloadState,
}

impl fmt::Display for CourseProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "course {}: {:.0}% ({}/{} files)",
            self.course_id,
            self.progress * 100.0,
            self.downloaded_files,
            self.total_files
        )
    }
}

/// Group records by course, ordered by course id.
///
/// A course without its own record takes the rollup of its file states.
pub fn course_summaries(records: &[StateProgressRecord]) -> Vec<CourseProgressSummary> {
    #[derive(Default)]
    struct Acc {
        course_state: Option<DownloadState>,
        files: Vec<DownloadState>,
    }

    let mut courses: BTreeMap<&str, Acc> = BTreeMap::new();
    for record in records {
        let acc = courses.entry(record.selection.course_id()).or_default();
        match record.selection.kind() {
            "course" => acc.course_state = Some(record.state),
            "file" => acc.files.push(record.state),
            _ => {}
        }
    }

    courses
        .into_iter()
        .map(|(course_id, acc)| {
            let total_files = acc.files.len();
            let downloaded_files = acc
                .files
                .iter()
                .filter(|s| **s == DownloadState::Downloaded)
                .count();
            let progress = if total_files == 0 {
                0.0
            } else {
                acc.files.iter().map(DownloadState::fraction).sum::<f64>() / total_files as f64
            };
            CourseProgressSummary {
                course_id: course_id.to_string(),
                progress,
                downloaded_files,
                total_files,
                state: acc
                    .course_state
                    .unwrap_or_else(|| rollup(acc.files.iter().copied())),
            }
        })
        .collect()
}
