//! Types for the progress stores.

use serde::{Deserialize, Serialize};

use crate::model::{DownloadState, SelectionState, SyncEntry};

/// Which tree node a state record tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemSelection {
    Course { course_id: String },
    Tab { course_id: String, tab_id: String },
    File { course_id: String, file_id: String },
}

impl ItemSelection {
    /// Convert to the kind string stored in the database.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Course { .. } => "course",
            Self::Tab { .. } => "tab",
            Self::File { .. } => "file",
        }
    }

    pub fn course_id(&self) -> &str {
        match self {
            Self::Course { course_id }
            | Self::Tab { course_id, .. }
            | Self::File { course_id, .. } => course_id,
        }
    }

    /// Tab or file id; `None` for a course.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::Course { .. } => None,
            Self::Tab { tab_id, .. } => Some(tab_id),
            Self::File { file_id, .. } => Some(file_id),
        }
    }

    /// Parse from the stored kind, course id and item id columns.
    pub fn from_parts(kind: &str, course_id: String, item_id: Option<String>) -> Option<Self> {
        match (kind, item_id) {
            ("course", _) => Some(Self::Course { course_id }),
            ("tab", Some(tab_id)) => Some(Self::Tab { course_id, tab_id }),
            ("file", Some(file_id)) => Some(Self::File { course_id, file_id }),
            _ => None,
        }
    }
}

/// Durable per-item lifecycle row. `id` is the tree id of the item, so
/// repeated saves update the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateProgressRecord {
    pub id: String,
    pub selection: ItemSelection,
    pub state: DownloadState,
}

impl StateProgressRecord {
    pub fn new(id: impl Into<String>, selection: ItemSelection, state: DownloadState) -> Self {
        Self {
            id: id.into(),
            selection,
            state,
        }
    }
}

/// Records for every selected node of `entry`, all in `state`.
pub fn records_for_selected(entry: &SyncEntry, state: DownloadState) -> Vec<StateProgressRecord> {
    let course_id = entry.course_id().to_string();
    let mut records = Vec::new();
    if entry.selection_state == SelectionState::NotSelected {
        return records;
    }

    records.push(StateProgressRecord::new(
        entry.id.clone(),
        ItemSelection::Course {
            course_id: course_id.clone(),
        },
        state,
    ));
    for tab in entry.tabs.iter().filter(|t| t.selection_state.is_any()) {
        records.push(StateProgressRecord::new(
            tab.id.clone(),
            ItemSelection::Tab {
                course_id: course_id.clone(),
                tab_id: tab.tab_type.as_str().to_string(),
            },
            state,
        ));
    }
    for file in entry.selected_files() {
        records.push(StateProgressRecord::new(
            file.id.clone(),
            ItemSelection::File {
                course_id: course_id.clone(),
                file_id: file.file_id.clone(),
            },
            state,
        ));
    }
    records
}

/// Singleton cross-course summary of the current sync run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateProgressRecord {
    pub bytes_to_download: u64,
    pub bytes_downloaded: u64,
    pub is_finished: bool,
    pub error: Option<String>,
    /// Courses covered by the run. Only ever grows while the run lasts.
    pub course_ids: Vec<String>,
}

/// Error stored on the aggregate when files fail.
pub const FILE_DOWNLOAD_FAILED: &str = "File download failed.";

impl AggregateProgressRecord {
    /// Recompute bytes and error from the entries' selected files.
    ///
    /// `is_finished` and `course_ids` are left to the caller, which owns
    /// the previously persisted values.
    pub fn from_entries(entries: &[SyncEntry]) -> Self {
        let mut bytes_to_download = 0;
        let mut bytes_downloaded = 0;
        let mut any_error = false;
        let mut any_loading = false;

        for file in entries.iter().flat_map(|e| e.selected_files()) {
            bytes_to_download += file.bytes_to_download;
            bytes_downloaded += file.progress_bytes();
            match file.state {
                DownloadState::Error => any_error = true,
                DownloadState::Loading(_) => any_loading = true,
                _ => {}
            }
        }

        Self {
            bytes_to_download,
            bytes_downloaded,
            is_finished: false,
            error: (any_error && !any_loading).then(|| FILE_DOWNLOAD_FAILED.to_string()),
            course_ids: entries.iter().map(|e| e.course_id().to_string()).collect(),
        }
    }

    /// Fraction downloaded, 0 when there is nothing to download.
    pub fn progress(&self) -> f64 {
        if self.bytes_to_download == 0 {
            0.0
        } else {
            self.bytes_downloaded as f64 / self.bytes_to_download as f64
        }
    }

    pub fn is_sync_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Add `others` to `course_ids`, keeping first-seen order.
    pub fn union_course_ids<'a, I>(&mut self, others: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for id in others {
            if !self.course_ids.contains(id) {
                self.course_ids.push(id.clone());
            }
        }
    }

    pub fn syncing_message(&self) -> String {
        match self.course_ids.len() {
            1 => "1 course is syncing.".to_string(),
            n => format!("{n} courses are syncing."),
        }
    }
}

/// Number of state records per download state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub not_started: u64,
    pub loading: u64,
    pub downloaded: u64,
    pub failed: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.not_started + self.loading + self.downloaded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entry::fixtures::{entry, file};
    use crate::model::{select_course, select_file, file_id, TabType};

    fn two_file_course(a: DownloadState, b: DownloadState) -> SyncEntry {
        let mut e = select_course(
            entry("1", &[TabType::Files], vec![file("1", "a", 1000), file("1", "b", 1000)]),
            true,
        );
        e.files[0].state = a;
        e.files[1].state = b;
        e
    }

    #[test]
    fn test_item_selection_round_trip() {
        for selection in [
            ItemSelection::Course {
                course_id: "1".into(),
            },
            ItemSelection::Tab {
                course_id: "1".into(),
                tab_id: "pages".into(),
            },
            ItemSelection::File {
                course_id: "1".into(),
                file_id: "9".into(),
            },
        ] {
            let parsed = ItemSelection::from_parts(
                selection.kind(),
                selection.course_id().to_string(),
                selection.item_id().map(str::to_string),
            );
            assert_eq!(parsed, Some(selection));
        }
        assert_eq!(ItemSelection::from_parts("tab", "1".into(), None), None);
        assert_eq!(ItemSelection::from_parts("bogus", "1".into(), None), None);
    }

    #[test]
    fn test_aggregate_all_downloaded() {
        let e = two_file_course(DownloadState::Downloaded, DownloadState::Downloaded);
        let agg = AggregateProgressRecord::from_entries(&[e]);
        assert_eq!(agg.bytes_to_download, 2000);
        assert_eq!(agg.bytes_downloaded, 2000);
        assert!((agg.progress() - 1.0).abs() < f64::EPSILON);
        assert!(agg.error.is_none());
    }

    #[test]
    fn test_aggregate_partial_progress() {
        let e = two_file_course(DownloadState::Loading(Some(0.5)), DownloadState::Downloaded);
        let agg = AggregateProgressRecord::from_entries(&[e]);
        assert_eq!(agg.bytes_to_download, 2000);
        assert_eq!(agg.bytes_downloaded, 1500);
        assert!((agg.progress() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_aggregate_error_contributes_nothing() {
        let e = two_file_course(DownloadState::Error, DownloadState::Loading(Some(0.5)));
        let agg = AggregateProgressRecord::from_entries(&[e]);
        assert_eq!(agg.bytes_downloaded, 500);
        assert!((agg.progress() - 0.25).abs() < f64::EPSILON);
        // Still loading, so not failed yet.
        assert!(agg.error.is_none());
    }

    #[test]
    fn test_aggregate_error_once_settled() {
        let e = two_file_course(DownloadState::Error, DownloadState::Downloaded);
        let agg = AggregateProgressRecord::from_entries(&[e]);
        assert_eq!(agg.error.as_deref(), Some(FILE_DOWNLOAD_FAILED));
        assert!(agg.is_sync_failed());
    }

    #[test]
    fn test_aggregate_ignores_unselected_files() {
        let e = entry("1", &[TabType::Files], vec![file("1", "a", 1000), file("1", "b", 1000)]);
        let mut e = select_file(e, &file_id("1", "a"), true);
        e.files[1].state = DownloadState::Error;
        let agg = AggregateProgressRecord::from_entries(&[e]);
        assert_eq!(agg.bytes_to_download, 1000);
        assert!(agg.error.is_none());
    }

    #[test]
    fn test_progress_zero_denominator() {
        assert_eq!(AggregateProgressRecord::default().progress(), 0.0);
    }

    #[test]
    fn test_union_course_ids() {
        let mut agg = AggregateProgressRecord {
            course_ids: vec!["1".into(), "2".into()],
            ..Default::default()
        };
        agg.union_course_ids(&["2".to_string(), "3".to_string()]);
        assert_eq!(agg.course_ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_syncing_message() {
        let mut agg = AggregateProgressRecord {
            course_ids: vec!["1".into()],
            ..Default::default()
        };
        assert_eq!(agg.syncing_message(), "1 course is syncing.");
        agg.course_ids.push("2".into());
        assert_eq!(agg.syncing_message(), "2 courses are syncing.");
    }

    #[test]
    fn test_records_for_selected() {
        let e = entry("5", &[TabType::Pages, TabType::Files], vec![file("5", "1", 3)]);
        assert!(records_for_selected(&e, DownloadState::Loading(None)).is_empty());

        let e = select_file(e, &file_id("5", "1"), true);
        let records = records_for_selected(&e, DownloadState::Loading(None));
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["courses/5", "courses/5/tabs/files", "courses/5/files/1"]);
        assert!(records
            .iter()
            .all(|r| r.state == DownloadState::Loading(None)));
    }
}
