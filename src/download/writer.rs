//! Single serialized writer for a sync run.
//!
//! Workers push [`ProgressEvent`]s over a channel; only the writer task
//! touches the in-memory entries and the durable stores. State changes are
//! applied forward only, byte progress is coalesced per file, and terminal
//! states are always written.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::DownloadProgress;
use crate::model::{rollup, DownloadState, SyncEntry, TabType};
use crate::state::{ItemSelection, ProgressStore};

const CHANNEL_CAPACITY: usize = 256;

/// Node addressed by a state event, relative to its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ItemRef {
    Course,
    Tab(String),
    File(String),
}

#[derive(Debug, Clone)]
pub(crate) enum ProgressEvent {
    State {
        entry_id: String,
        item: ItemRef,
        state: DownloadState,
    },
    FileBytes {
        entry_id: String,
        file_id: String,
        progress: DownloadProgress,
    },
    /// Outcome of one hidden-content fetch, folded into the
    /// additional-content tab when the course settles.
    AdditionalResult { entry_id: String, success: bool },
    /// All selected files of the entry are terminal.
    FilesSettled { entry_id: String },
    /// Every download of the entry has finished.
    CourseSettled { entry_id: String },
}

/// Cloneable sending side handed to workers.
#[derive(Debug, Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<ProgressEvent>,
}

impl WriterHandle {
    pub(crate) async fn send(&self, event: ProgressEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Progress writer closed, dropping event");
        }
    }

    pub(crate) async fn set_state(&self, entry_id: &str, item: ItemRef, state: DownloadState) {
        self.send(ProgressEvent::State {
            entry_id: entry_id.to_string(),
            item,
            state,
        })
        .await;
    }
}

/// What the writer hands back once every handle is dropped.
#[derive(Debug)]
pub(crate) struct WriterReport {
    pub entries: Vec<SyncEntry>,
    pub write_errors: u64,
}

pub(crate) struct ProgressWriter {
    entries: Vec<SyncEntry>,
    store: Arc<dyn ProgressStore>,
    interval: Duration,
    last_flush: HashMap<String, Instant>,
    additional_failed: HashSet<String>,
    write_errors: u64,
}

impl ProgressWriter {
    /// Start the writer task. It ends when the last handle is dropped.
    pub(crate) fn spawn(
        entries: Vec<SyncEntry>,
        store: Arc<dyn ProgressStore>,
        interval: Duration,
    ) -> (WriterHandle, JoinHandle<WriterReport>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = Self {
            entries,
            store,
            interval,
            last_flush: HashMap::new(),
            additional_failed: HashSet::new(),
            write_errors: 0,
        };
        let handle = tokio::spawn(writer.run(rx));
        (WriterHandle { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ProgressEvent>) -> WriterReport {
        while let Some(event) = rx.recv().await {
            self.apply(event).await;
        }
        WriterReport {
            entries: self.entries,
            write_errors: self.write_errors,
        }
    }

    async fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::State {
                entry_id,
                item,
                state,
            } => {
                if self.set_state(&entry_id, &item, state).await {
                    self.persist_aggregate().await;
                }
            }
            ProgressEvent::FileBytes {
                entry_id,
                file_id,
                progress,
            } => self.file_bytes(&entry_id, &file_id, progress).await,
            ProgressEvent::AdditionalResult { entry_id, success } => {
                if !success {
                    self.additional_failed.insert(entry_id);
                }
            }
            ProgressEvent::FilesSettled { entry_id } => self.files_settled(&entry_id).await,
            ProgressEvent::CourseSettled { entry_id } => self.course_settled(&entry_id).await,
        }
    }

    fn entry_index(&self, entry_id: &str) -> Option<usize> {
        let index = self.entries.iter().position(|e| e.id == entry_id);
        if index.is_none() {
            tracing::warn!(entry_id = %entry_id, "Progress event for unknown entry");
        }
        index
    }

    /// Apply a forward-only state change and persist the item record.
    /// Returns whether anything changed.
    async fn set_state(&mut self, entry_id: &str, item: &ItemRef, state: DownloadState) -> bool {
        let Some(index) = self.entry_index(entry_id) else {
            return false;
        };
        let entry = &mut self.entries[index];
        let Some((id, selection, current)) = slot(entry, item) else {
            tracing::warn!(entry_id = %entry_id, item = ?item, "Progress event for unknown item");
            return false;
        };
        if !current.can_transition_to(&state) {
            tracing::debug!(id = %id, from = ?current, to = ?state, "Ignoring backward state change");
            return false;
        }
        *current = state;

        if let Err(e) = self.store.save_state_progress(&id, &selection, state).await {
            self.write_errors += 1;
            tracing::warn!(id = %id, error = %e, "Failed to save item state");
        }
        true
    }

    async fn persist_aggregate(&mut self) {
        if let Err(e) = self.store.save_download_progress(&self.entries).await {
            self.write_errors += 1;
            tracing::warn!(error = %e, "Failed to save download progress");
        }
    }

    async fn file_bytes(&mut self, entry_id: &str, file_id: &str, progress: DownloadProgress) {
        let Some(index) = self.entry_index(entry_id) else {
            return;
        };
        let entry = &mut self.entries[index];
        let Some(file) = entry.file_mut(file_id) else {
            return;
        };
        if file.state.is_terminal() {
            return;
        }

        file.bytes_downloaded = progress.bytes_downloaded;
        let fraction = progress.fraction().or_else(|| {
            (file.bytes_to_download > 0).then(|| {
                (progress.bytes_downloaded as f64 / file.bytes_to_download as f64).clamp(0.0, 1.0)
            })
        });
        file.state = DownloadState::Loading(fraction);
        let remote_id = file.file_id.clone();

        let now = Instant::now();
        let due = self
            .last_flush
            .get(file_id)
            .map_or(true, |last| now.duration_since(*last) >= self.interval);
        if !due {
            return;
        }
        self.last_flush.insert(file_id.to_string(), now);

        let file_state = DownloadState::Loading(fraction);
        let file_selection = ItemSelection::File {
            course_id: entry.course_id().to_string(),
            file_id: remote_id,
        };
        if let Err(e) = self
            .store
            .save_state_progress(file_id, &file_selection, file_state)
            .await
        {
            self.write_errors += 1;
            tracing::warn!(id = %file_id, error = %e, "Failed to save file progress");
        }

        let entry = &self.entries[index];
        let files_tab = entry
            .tab_of_type(TabType::Files)
            .filter(|t| t.selection_state.is_any() && !t.state.is_terminal())
            .map(|t| t.id.clone());
        if let Some(tab_id) = files_tab {
            let overall = DownloadState::Loading(Some(entry.progress()));
            self.set_state(entry_id, &ItemRef::Tab(tab_id), overall).await;
        }

        self.persist_aggregate().await;
    }

    async fn files_settled(&mut self, entry_id: &str) {
        let Some(index) = self.entry_index(entry_id) else {
            return;
        };
        let entry = &self.entries[index];
        let state = rollup(entry.selected_files().map(|f| f.state));
        let files_tab = entry
            .tab_of_type(TabType::Files)
            .filter(|t| t.selection_state.is_any())
            .map(|t| t.id.clone());

        if let Some(tab_id) = files_tab {
            if self.set_state(entry_id, &ItemRef::Tab(tab_id), state).await {
                self.persist_aggregate().await;
            }
        }
    }

    async fn course_settled(&mut self, entry_id: &str) {
        let Some(index) = self.entry_index(entry_id) else {
            return;
        };
        let entry = &self.entries[index];
        let children = entry
            .tabs
            .iter()
            .filter(|t| t.tab_type != TabType::AdditionalContent && t.selection_state.is_any())
            .map(|t| t.state)
            .chain(entry.selected_files().map(|f| f.state));
        let mut state = rollup(children);
        if self.additional_failed.contains(entry_id) {
            state = DownloadState::Error;
        }

        let additional = entry
            .tab_of_type(TabType::AdditionalContent)
            .filter(|t| t.selection_state.is_any())
            .map(|t| t.id.clone());
        if let Some(tab_id) = additional {
            self.set_state(entry_id, &ItemRef::Tab(tab_id), state).await;
        }
        self.set_state(entry_id, &ItemRef::Course, state).await;
        self.persist_aggregate().await;

        tracing::info!(
            course_id = %self.entries[index].course_id(),
            state = state.as_str(),
            "Course sync settled"
        );
    }
}

/// Locate the record id, selection and mutable state of `item` in `entry`.
fn slot<'a>(
    entry: &'a mut SyncEntry,
    item: &ItemRef,
) -> Option<(String, ItemSelection, &'a mut DownloadState)> {
    let course_id = entry.course_id().to_string();
    match item {
        ItemRef::Course => Some((
            entry.id.clone(),
            ItemSelection::Course { course_id },
            &mut entry.state,
        )),
        ItemRef::Tab(tab_id) => {
            let tab = entry.tab_mut(tab_id)?;
            Some((
                tab.id.clone(),
                ItemSelection::Tab {
                    course_id,
                    tab_id: tab.tab_type.as_str().to_string(),
                },
                &mut tab.state,
            ))
        }
        ItemRef::File(file_id) => {
            let file = entry.file_mut(file_id)?;
            Some((
                file.id.clone(),
                ItemSelection::File {
                    course_id,
                    file_id: file.file_id.clone(),
                },
                &mut file.state,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entry::fixtures::{entry, file};
    use crate::model::{file_id, select_course, tab_id};
    use crate::state::SqliteProgressStore;

    fn course() -> SyncEntry {
        let mut e = select_course(
            entry("1", &[TabType::Files], vec![file("1", "a", 1000), file("1", "b", 1000)]),
            true,
        );
        e.state = DownloadState::Loading(None);
        for tab in &mut e.tabs {
            tab.state = DownloadState::Loading(None);
        }
        for f in &mut e.files {
            f.state = DownloadState::Loading(None);
        }
        e
    }

    fn bytes(done: u64) -> DownloadProgress {
        DownloadProgress {
            bytes_downloaded: done,
            total_bytes: Some(1000),
        }
    }

    async fn file_state(store: &SqliteProgressStore, id: &str) -> Option<DownloadState> {
        store
            .get_state_progress()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.id == id)
            .map(|r| r.state)
    }

    #[tokio::test]
    async fn test_byte_progress_is_coalesced() {
        let store = Arc::new(SqliteProgressStore::open_in_memory().unwrap());
        let (handle, join) =
            ProgressWriter::spawn(vec![course()], store.clone(), Duration::from_secs(3600));
        let fid = file_id("1", "a");

        for done in [100, 200, 300] {
            handle
                .send(ProgressEvent::FileBytes {
                    entry_id: "courses/1".into(),
                    file_id: fid.clone(),
                    progress: bytes(done),
                })
                .await;
        }
        drop(handle);
        let report = join.await.unwrap();

        // Only the first event reached the store.
        assert_eq!(
            file_state(&store, &fid).await,
            Some(DownloadState::Loading(Some(0.1)))
        );
        // Memory always holds the latest value.
        let f = &report.entries[0].files[0];
        assert_eq!(f.bytes_downloaded, 300);
        assert_eq!(f.state, DownloadState::Loading(Some(0.3)));

        let agg = store.get_download_progress().await.unwrap().unwrap();
        assert_eq!(agg.bytes_downloaded, 100);
    }

    #[tokio::test]
    async fn test_terminal_state_always_written_and_final() {
        let store = Arc::new(SqliteProgressStore::open_in_memory().unwrap());
        let (handle, join) =
            ProgressWriter::spawn(vec![course()], store.clone(), Duration::from_secs(3600));
        let fid = file_id("1", "a");

        handle
            .send(ProgressEvent::FileBytes {
                entry_id: "courses/1".into(),
                file_id: fid.clone(),
                progress: bytes(500),
            })
            .await;
        handle
            .set_state("courses/1", ItemRef::File(fid.clone()), DownloadState::Downloaded)
            .await;
        // Late progress and backward transitions are ignored.
        handle
            .send(ProgressEvent::FileBytes {
                entry_id: "courses/1".into(),
                file_id: fid.clone(),
                progress: bytes(600),
            })
            .await;
        handle
            .set_state("courses/1", ItemRef::File(fid.clone()), DownloadState::Loading(None))
            .await;
        drop(handle);
        let report = join.await.unwrap();

        assert_eq!(file_state(&store, &fid).await, Some(DownloadState::Downloaded));
        assert_eq!(report.entries[0].files[0].state, DownloadState::Downloaded);
        assert_eq!(report.write_errors, 0);
    }

    #[tokio::test]
    async fn test_loading_file_not_reset_to_not_started() {
        let store = Arc::new(SqliteProgressStore::open_in_memory().unwrap());
        let (handle, join) =
            ProgressWriter::spawn(vec![course()], store.clone(), Duration::from_secs(3600));
        let fid = file_id("1", "b");

        handle
            .send(ProgressEvent::FileBytes {
                entry_id: "courses/1".into(),
                file_id: fid.clone(),
                progress: bytes(250),
            })
            .await;
        handle
            .set_state("courses/1", ItemRef::File(fid.clone()), DownloadState::NotStarted)
            .await;
        drop(handle);
        let report = join.await.unwrap();

        assert_eq!(
            file_state(&store, &fid).await,
            Some(DownloadState::Loading(Some(0.25)))
        );
        assert_eq!(
            report.entries[0].files[1].state,
            DownloadState::Loading(Some(0.25))
        );
    }

    #[tokio::test]
    async fn test_files_and_course_rollup() {
        let store = Arc::new(SqliteProgressStore::open_in_memory().unwrap());
        let (handle, join) = ProgressWriter::spawn(vec![course()], store.clone(), Duration::ZERO);

        handle
            .set_state("courses/1", ItemRef::File(file_id("1", "a")), DownloadState::Downloaded)
            .await;
        handle
            .set_state("courses/1", ItemRef::File(file_id("1", "b")), DownloadState::Error)
            .await;
        handle
            .send(ProgressEvent::FilesSettled {
                entry_id: "courses/1".into(),
            })
            .await;
        handle
            .send(ProgressEvent::CourseSettled {
                entry_id: "courses/1".into(),
            })
            .await;
        drop(handle);
        let report = join.await.unwrap();

        let e = &report.entries[0];
        assert_eq!(e.tab_of_type(TabType::Files).unwrap().state, DownloadState::Error);
        assert_eq!(e.state, DownloadState::Error);
        assert_eq!(
            e.tab_of_type(TabType::AdditionalContent).unwrap().state,
            DownloadState::Error
        );
        assert_eq!(
            file_state(&store, &tab_id("1", TabType::Files)).await,
            Some(DownloadState::Error)
        );

        let agg = store.get_download_progress().await.unwrap().unwrap();
        assert_eq!(agg.bytes_to_download, 2000);
        assert_eq!(agg.bytes_downloaded, 1000);
        assert_eq!(agg.course_ids, vec!["1"]);
    }

    #[tokio::test]
    async fn test_failed_additional_content_fails_course() {
        let store = Arc::new(SqliteProgressStore::open_in_memory().unwrap());
        let mut e = course();
        e.files.clear();
        e.tabs.retain(|t| t.tab_type == TabType::AdditionalContent);
        let (handle, join) = ProgressWriter::spawn(vec![e], store.clone(), Duration::ZERO);

        handle
            .send(ProgressEvent::AdditionalResult {
                entry_id: "courses/1".into(),
                success: true,
            })
            .await;
        handle
            .send(ProgressEvent::AdditionalResult {
                entry_id: "courses/1".into(),
                success: false,
            })
            .await;
        handle
            .send(ProgressEvent::CourseSettled {
                entry_id: "courses/1".into(),
            })
            .await;
        drop(handle);
        let report = join.await.unwrap();
        assert_eq!(report.entries[0].state, DownloadState::Error);
    }

    #[tokio::test]
    async fn test_unknown_entry_is_ignored() {
        let store = Arc::new(SqliteProgressStore::open_in_memory().unwrap());
        let (handle, join) = ProgressWriter::spawn(vec![course()], store.clone(), Duration::ZERO);
        handle
            .set_state("courses/404", ItemRef::Course, DownloadState::Downloaded)
            .await;
        drop(handle);
        join.await.unwrap();
        assert!(store.get_state_progress().await.unwrap().is_empty());
    }
}
