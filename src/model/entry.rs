//! Selection tree types for a single course: the entry, its tabs and files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tri-state selection flag of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectionState {
    #[default]
    NotSelected,
    PartiallySelected,
    Selected,
}

impl SelectionState {
    /// Build a parent state from "all children selected" / "any child selected".
    pub fn from_children(all: bool, any: bool) -> Self {
        if all {
            Self::Selected
        } else if any {
            Self::PartiallySelected
        } else {
            Self::NotSelected
        }
    }

    pub fn from_bool(selected: bool) -> Self {
        if selected {
            Self::Selected
        } else {
            Self::NotSelected
        }
    }

    /// True for `Selected` and `PartiallySelected`.
    pub fn is_any(&self) -> bool {
        *self != Self::NotSelected
    }
}

/// Transfer lifecycle of a course, tab or file within one sync run.
///
/// `Downloaded` and `Error` are terminal for the run; only `NotStarted`
/// and `Loading` move forward.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum DownloadState {
    #[default]
    NotStarted,
    Loading(Option<f64>),
    Downloaded,
    Error,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Downloaded | Self::Error)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading(_))
    }

    /// Whether moving from `self` to `next` respects the forward-only rule.
    pub fn can_transition_to(&self, next: &DownloadState) -> bool {
        match (self, next) {
            (current, next) if current.is_terminal() => current == next,
            (Self::Loading(_), Self::NotStarted) => false,
            _ => true,
        }
    }

    /// Completion fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        match self {
            Self::Downloaded => 1.0,
            Self::Loading(p) => p.unwrap_or(0.0).clamp(0.0, 1.0),
            Self::NotStarted | Self::Error => 0.0,
        }
    }

    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Loading(_) => "loading",
            Self::Downloaded => "downloaded",
            Self::Error => "error",
        }
    }

    /// Rebuild from the stored state string and optional progress column.
    pub fn from_parts(s: &str, progress: Option<f64>) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "loading" => Some(Self::Loading(progress)),
            "downloaded" => Some(Self::Downloaded),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Progress value persisted next to the state string.
    pub fn progress(&self) -> Option<f64> {
        match self {
            Self::Loading(p) => *p,
            _ => None,
        }
    }
}

/// Aggregate child states into a parent state.
///
/// All downloaded (or no children) gives `Downloaded`; any error with nothing
/// still in flight gives `Error`; anything else is `Loading`.
pub fn rollup<I>(states: I) -> DownloadState
where
    I: IntoIterator<Item = DownloadState>,
{
    let mut all_downloaded = true;
    let mut any_error = false;
    let mut any_pending = false;

    for state in states {
        match state {
            DownloadState::Downloaded => {}
            DownloadState::Error => {
                all_downloaded = false;
                any_error = true;
            }
            DownloadState::Loading(_) | DownloadState::NotStarted => {
                all_downloaded = false;
                any_pending = true;
            }
        }
    }

    if all_downloaded {
        DownloadState::Downloaded
    } else if any_error && !any_pending {
        DownloadState::Error
    } else {
        DownloadState::Loading(None)
    }
}

/// Course tab kinds that can be synced for offline use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TabType {
    Assignments,
    Announcements,
    Discussions,
    Files,
    Grades,
    Modules,
    Pages,
    People,
    Quizzes,
    Syllabus,
    /// Synthetic tab tracking hidden tabs and course metadata.
    AdditionalContent,
}

impl TabType {
    /// Tab types backed by remote content, in sync order.
    pub const OFFLINE_SYNCABLE: [TabType; 10] = [
        TabType::Assignments,
        TabType::Announcements,
        TabType::Discussions,
        TabType::Files,
        TabType::Grades,
        TabType::Modules,
        TabType::Pages,
        TabType::People,
        TabType::Quizzes,
        TabType::Syllabus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assignments => "assignments",
            Self::Announcements => "announcements",
            Self::Discussions => "discussions",
            Self::Files => "files",
            Self::Grades => "grades",
            Self::Modules => "modules",
            Self::Pages => "pages",
            Self::People => "people",
            Self::Quizzes => "quizzes",
            Self::Syllabus => "syllabus",
            Self::AdditionalContent => "additional-content",
        }
    }

    /// Parse a remote tab id. Unknown tabs are not syncable and yield `None`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "assignments" => Some(Self::Assignments),
            "announcements" => Some(Self::Announcements),
            "discussions" | "discussion_topics" => Some(Self::Discussions),
            "files" => Some(Self::Files),
            "grades" => Some(Self::Grades),
            "modules" => Some(Self::Modules),
            "pages" => Some(Self::Pages),
            "people" => Some(Self::People),
            "quizzes" => Some(Self::Quizzes),
            "syllabus" => Some(Self::Syllabus),
            "additional-content" => Some(Self::AdditionalContent),
            _ => None,
        }
    }

    /// Tabs whose content is fetched as a whole rather than file by file.
    pub fn is_content(&self) -> bool {
        !matches!(self, Self::Files | Self::AdditionalContent)
    }
}

pub fn entry_id(course_id: &str) -> String {
    format!("courses/{course_id}")
}

pub fn tab_id(course_id: &str, tab: TabType) -> String {
    format!("courses/{course_id}/tabs/{}", tab.as_str())
}

pub fn file_id(course_id: &str, file_id: &str) -> String {
    format!("courses/{course_id}/files/{file_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTab {
    pub id: String,
    pub name: String,
    pub tab_type: TabType,
    pub selection_state: SelectionState,
    pub state: DownloadState,
}

impl SyncTab {
    pub fn new(id: String, name: String, tab_type: TabType) -> Self {
        Self {
            id,
            name,
            tab_type,
            selection_state: SelectionState::NotSelected,
            state: DownloadState::NotStarted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFile {
    /// Tree id, `courses/{cid}/files/{fid}`.
    pub id: String,
    /// Remote file id.
    pub file_id: String,
    pub display_name: String,
    pub file_name: String,
    pub url: String,
    pub mime_class: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub bytes_to_download: u64,
    /// Exact streamed byte count, 0 when the transport has not reported one.
    pub bytes_downloaded: u64,
    pub selection_state: SelectionState,
    pub state: DownloadState,
}

impl SyncFile {
    pub fn is_selected(&self) -> bool {
        self.selection_state == SelectionState::Selected
    }

    /// Bytes this file contributes to aggregate progress.
    ///
    /// A loading file reports its exact counter when one is known and falls
    /// back to `bytes_to_download * fraction` otherwise.
    pub fn progress_bytes(&self) -> u64 {
        match self.state {
            DownloadState::Downloaded => self.bytes_to_download,
            DownloadState::Loading(fraction) => {
                if self.bytes_downloaded > 0 {
                    self.bytes_downloaded.min(self.bytes_to_download)
                } else {
                    let p = fraction.unwrap_or(0.0).clamp(0.0, 1.0);
                    (self.bytes_to_download as f64 * p).round() as u64
                }
            }
            DownloadState::NotStarted | DownloadState::Error => 0,
        }
    }
}

/// Per-course root of the selection tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    /// `courses/{cid}`; use [`SyncEntry::course_id`] for the API id.
    pub id: String,
    pub name: String,
    pub has_front_page: bool,
    /// Remote tabs plus the synthetic additional-content tab.
    pub tabs: Vec<SyncTab>,
    pub files: Vec<SyncFile>,
    pub selection_state: SelectionState,
    pub state: DownloadState,
}

impl SyncEntry {
    pub fn new(id: String, name: String, has_front_page: bool) -> Self {
        Self {
            id,
            name,
            has_front_page,
            tabs: Vec::new(),
            files: Vec::new(),
            selection_state: SelectionState::NotSelected,
            state: DownloadState::NotStarted,
        }
    }

    pub fn course_id(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }

    pub fn tab_mut(&mut self, id: &str) -> Option<&mut SyncTab> {
        self.tabs.iter_mut().find(|t| t.id == id)
    }

    pub fn tab_of_type(&self, tab_type: TabType) -> Option<&SyncTab> {
        self.tabs.iter().find(|t| t.tab_type == tab_type)
    }

    pub fn file_mut(&mut self, id: &str) -> Option<&mut SyncFile> {
        self.files.iter_mut().find(|f| f.id == id)
    }

    /// Fully or partially selected tab types, additional content excluded.
    pub fn selected_tabs(&self) -> Vec<TabType> {
        self.tabs
            .iter()
            .filter(|t| t.tab_type != TabType::AdditionalContent)
            .filter(|t| t.selection_state.is_any())
            .map(|t| t.tab_type)
            .collect()
    }

    pub fn selected_tabs_count(&self) -> usize {
        self.selected_tabs().len()
    }

    pub fn selected_files(&self) -> impl Iterator<Item = &SyncFile> {
        self.files.iter().filter(|f| f.is_selected())
    }

    pub fn selected_files_count(&self) -> usize {
        self.selected_files().count()
    }

    /// Selected items as shown to the user. Files under a selected files tab
    /// are not counted twice.
    pub fn selection_count(&self) -> usize {
        let files = self.selected_files_count();
        let tabs = self.selected_tabs_count();
        let files_tab_counted = self
            .tab_of_type(TabType::Files)
            .is_some_and(|t| t.selection_state.is_any());
        if files > 0 && files_tab_counted {
            files + tabs - 1
        } else {
            files + tabs
        }
    }

    pub fn is_full_content_sync(&self) -> bool {
        self.selection_state == SelectionState::Selected
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.bytes_to_download).sum()
    }

    pub fn total_selected_size(&self) -> u64 {
        self.selected_files().map(|f| f.bytes_to_download).sum()
    }

    pub fn total_downloaded_size(&self) -> u64 {
        self.selected_files().map(SyncFile::progress_bytes).sum()
    }

    /// Mean completion of the selected files, 0 when nothing is selected.
    pub fn progress(&self) -> f64 {
        let selected = self.selected_files_count();
        if selected == 0 {
            return 0.0;
        }
        let total: f64 = self.selected_files().map(|f| f.state.fraction()).sum();
        total / selected as f64
    }

    pub fn has_file_error(&self) -> bool {
        self.files.iter().any(|f| f.state == DownloadState::Error)
    }

    /// True if the course, any tab or any file failed.
    pub fn has_error(&self) -> bool {
        self.state == DownloadState::Error
            || self.tabs.iter().any(|t| t.state == DownloadState::Error)
            || self.has_file_error()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn file(course_id: &str, fid: &str, bytes: u64) -> SyncFile {
        SyncFile {
            id: file_id(course_id, fid),
            file_id: fid.to_string(),
            display_name: format!("file-{fid}"),
            file_name: format!("file-{fid}.pdf"),
            url: format!("https://canvas.example.com/files/{fid}/download"),
            mime_class: "pdf".to_string(),
            updated_at: None,
            bytes_to_download: bytes,
            bytes_downloaded: 0,
            selection_state: SelectionState::NotSelected,
            state: DownloadState::NotStarted,
        }
    }

    /// Course with the given tabs (plus additional content) and files.
    pub fn entry(course_id: &str, tabs: &[TabType], files: Vec<SyncFile>) -> SyncEntry {
        let mut entry = SyncEntry::new(entry_id(course_id), format!("course {course_id}"), false);
        for tab in tabs.iter().chain(std::iter::once(&TabType::AdditionalContent)) {
            entry.tabs.push(SyncTab::new(
                tab_id(course_id, *tab),
                tab.as_str().to_string(),
                *tab,
            ));
        }
        entry.files = files;
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_rollup_all_downloaded() {
        let state = rollup([DownloadState::Downloaded, DownloadState::Downloaded]);
        assert_eq!(state, DownloadState::Downloaded);
    }

    #[test]
    fn test_rollup_empty_is_downloaded() {
        assert_eq!(rollup([]), DownloadState::Downloaded);
    }

    #[test]
    fn test_rollup_error_waits_for_loading() {
        let state = rollup([DownloadState::Error, DownloadState::Loading(Some(0.3))]);
        assert_eq!(state, DownloadState::Loading(None));

        let state = rollup([DownloadState::Error, DownloadState::Downloaded]);
        assert_eq!(state, DownloadState::Error);
    }

    #[test]
    fn test_download_state_round_trip() {
        for state in [
            DownloadState::NotStarted,
            DownloadState::Loading(Some(0.25)),
            DownloadState::Loading(None),
            DownloadState::Downloaded,
            DownloadState::Error,
        ] {
            assert_eq!(
                DownloadState::from_parts(state.as_str(), state.progress()),
                Some(state)
            );
        }
        assert_eq!(DownloadState::from_parts("bogus", None), None);
    }

    #[test]
    fn test_terminal_states_do_not_move() {
        assert!(!DownloadState::Downloaded.can_transition_to(&DownloadState::Loading(None)));
        assert!(!DownloadState::Error.can_transition_to(&DownloadState::Downloaded));
        assert!(DownloadState::Loading(Some(0.5)).can_transition_to(&DownloadState::Downloaded));
        assert!(DownloadState::NotStarted.can_transition_to(&DownloadState::Loading(None)));
    }

    #[test]
    fn test_loading_never_returns_to_not_started() {
        assert!(!DownloadState::Loading(None).can_transition_to(&DownloadState::NotStarted));
        assert!(!DownloadState::Loading(Some(0.4)).can_transition_to(&DownloadState::NotStarted));
        assert!(DownloadState::Loading(Some(0.4)).can_transition_to(&DownloadState::Loading(Some(0.6))));
        assert!(DownloadState::Loading(None).can_transition_to(&DownloadState::Error));
        assert!(DownloadState::NotStarted.can_transition_to(&DownloadState::NotStarted));
    }

    #[test]
    fn test_tab_type_parsing() {
        assert_eq!(TabType::from_str("files"), Some(TabType::Files));
        assert_eq!(TabType::from_str("discussion_topics"), Some(TabType::Discussions));
        assert_eq!(TabType::from_str("collaborations"), None);
        assert!(!TabType::Files.is_content());
        assert!(!TabType::AdditionalContent.is_content());
        assert!(TabType::Pages.is_content());
    }

    #[test]
    fn test_progress_bytes_prefers_exact_counter() {
        let mut f = file("1", "10", 1000);
        f.state = DownloadState::Loading(Some(0.5));
        assert_eq!(f.progress_bytes(), 500);

        f.bytes_downloaded = 640;
        assert_eq!(f.progress_bytes(), 640);

        f.state = DownloadState::Downloaded;
        assert_eq!(f.progress_bytes(), 1000);

        f.state = DownloadState::Error;
        assert_eq!(f.progress_bytes(), 0);
    }

    #[test]
    fn test_course_id_from_entry_id() {
        let e = entry("42", &[], Vec::new());
        assert_eq!(e.id, "courses/42");
        assert_eq!(e.course_id(), "42");
    }

    #[test]
    fn test_entry_progress_over_selected_files() {
        let mut a = file("1", "a", 100);
        a.selection_state = SelectionState::Selected;
        a.state = DownloadState::Downloaded;
        let mut b = file("1", "b", 100);
        b.selection_state = SelectionState::Selected;
        b.state = DownloadState::Loading(Some(0.5));
        let c = file("1", "c", 100);
        let e = entry("1", &[TabType::Files], vec![a, b, c]);

        assert!((e.progress() - 0.75).abs() < f64::EPSILON);
        assert_eq!(e.total_size(), 300);
        assert_eq!(e.total_selected_size(), 200);
        assert_eq!(e.total_downloaded_size(), 150);
    }

    #[test]
    fn test_has_error_checks_tabs_and_files() {
        let mut e = entry("1", &[TabType::Pages], vec![file("1", "a", 1)]);
        assert!(!e.has_error());
        e.tabs[0].state = DownloadState::Error;
        assert!(e.has_error());
        assert!(!e.has_file_error());
    }
}
