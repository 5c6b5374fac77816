//! Entry Composer: builds a course's selection tree from remote descriptors.

use std::sync::Arc;

use thiserror::Error;

use crate::api::{ApiError, CourseApi, CourseDescriptor, FileDescriptor};
use crate::model::{
    entry_id, file_id, tab_id, DownloadState, SelectionState, SyncEntry, SyncFile, SyncTab,
    TabType,
};

pub const ADDITIONAL_CONTENT_NAME: &str = "Additional Content";

/// Composition of one course failed; other courses are unaffected.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("Failed to fetch course {course_id}: {source}")]
    Course {
        course_id: String,
        #[source]
        source: ApiError,
    },

    #[error("Failed to fetch files of course {course_id}: {source}")]
    Files {
        course_id: String,
        #[source]
        source: ApiError,
    },
}

impl ComposeError {
    pub fn course_id(&self) -> &str {
        match self {
            Self::Course { course_id, .. } | Self::Files { course_id, .. } => course_id,
        }
    }
}

pub struct EntryComposer {
    api: Arc<dyn CourseApi>,
}

impl EntryComposer {
    pub fn new(api: Arc<dyn CourseApi>) -> Self {
        Self { api }
    }

    /// Fetch the course and its files and compose the tree.
    pub async fn compose_course(
        &self,
        course_id: &str,
        use_cache: bool,
    ) -> Result<SyncEntry, ComposeError> {
        let course = self
            .api
            .get_course(course_id)
            .await
            .map_err(|source| ComposeError::Course {
                course_id: course_id.to_string(),
                source,
            })?;
        self.compose_entry(&course, use_cache).await
    }

    /// Compose the tree for an already fetched course descriptor.
    ///
    /// File fetch failures are returned, never swallowed.
    pub async fn compose_entry(
        &self,
        course: &CourseDescriptor,
        use_cache: bool,
    ) -> Result<SyncEntry, ComposeError> {
        let files = self
            .api
            .get_files(&course.id, use_cache)
            .await
            .map_err(|source| ComposeError::Files {
                course_id: course.id.clone(),
                source,
            })?;

        let entry = build_entry(course, &files);
        tracing::debug!(
            course_id = %course.id,
            tabs = entry.tabs.len(),
            files = entry.files.len(),
            "Composed sync entry"
        );
        Ok(entry)
    }
}

/// Pure part of composition.
///
/// Keeps visible syncable tabs in their remote order, appends the synthetic
/// additional-content tab, and attaches every available file whether or not
/// the course shows a files tab.
pub fn build_entry(course: &CourseDescriptor, files: &[FileDescriptor]) -> SyncEntry {
    let mut entry = SyncEntry::new(
        entry_id(&course.id),
        course.name.clone(),
        course.has_front_page(),
    );

    for tab in course.tabs.iter().filter(|t| !t.hidden) {
        let Some(tab_type) = TabType::from_str(&tab.id) else {
            continue;
        };
        if !TabType::OFFLINE_SYNCABLE.contains(&tab_type) {
            continue;
        }
        if entry.tab_of_type(tab_type).is_some() {
            continue;
        }
        entry.tabs.push(SyncTab::new(
            tab_id(&course.id, tab_type),
            tab.label.clone(),
            tab_type,
        ));
    }

    entry.tabs.push(SyncTab::new(
        tab_id(&course.id, TabType::AdditionalContent),
        ADDITIONAL_CONTENT_NAME.to_string(),
        TabType::AdditionalContent,
    ));

    entry.files = files
        .iter()
        .filter(|f| f.is_available())
        .map(|f| SyncFile {
            id: file_id(&course.id, &f.id),
            file_id: f.id.clone(),
            display_name: f.display_name.clone(),
            file_name: f.filename.clone(),
            url: f.url.clone(),
            mime_class: f.mime_class.clone(),
            updated_at: f.updated_at,
            bytes_to_download: f.size,
            bytes_downloaded: 0,
            selection_state: SelectionState::NotSelected,
            state: DownloadState::NotStarted,
        })
        .collect();

    entry
}


#[cfg(test)]
mod tests {
    use super::fakes::{course, remote_file, FakeCourseApi};
    use super::*;

    fn composer(api: FakeCourseApi) -> (EntryComposer, Arc<FakeCourseApi>) {
        let api = Arc::new(api);
        (EntryComposer::new(api.clone()), api)
    }

    #[tokio::test]
    async fn test_empty_course_gets_only_additional_content() {
        let (composer, _) = composer(FakeCourseApi::default());
        let entry = composer
            .compose_entry(&course("1", &[]), false)
            .await
            .unwrap();

        assert_eq!(entry.tabs.len(), 1);
        assert_eq!(entry.tabs[0].tab_type, TabType::AdditionalContent);
        assert_eq!(entry.tabs[0].id, "courses/1/tabs/additional-content");
        assert_eq!(entry.tabs[0].name, ADDITIONAL_CONTENT_NAME);
        assert!(entry.files.is_empty());
    }

    #[tokio::test]
    async fn test_files_tab_with_one_file() {
        let api = FakeCourseApi::default()
            .with_course(course("2", &["files"]), vec![remote_file("10", 1000)]);
        let (composer, _) = composer(api);
        let entry = composer
            .compose_entry(&course("2", &["files"]), false)
            .await
            .unwrap();

        let types: Vec<TabType> = entry.tabs.iter().map(|t| t.tab_type).collect();
        assert_eq!(types, vec![TabType::Files, TabType::AdditionalContent]);
        assert_eq!(entry.files.len(), 1);
        let file = &entry.files[0];
        assert_eq!(file.id, "courses/2/files/10");
        assert_eq!(file.file_id, "10");
        assert_eq!(file.display_name, "Display 10");
        assert_eq!(file.bytes_to_download, 1000);
    }

    #[tokio::test]
    async fn test_files_attached_without_files_tab() {
        let api = FakeCourseApi::default()
            .with_course(course("3", &["pages"]), vec![remote_file("1", 5), remote_file("2", 5)]);
        let (composer, _) = composer(api);
        let entry = composer
            .compose_entry(&course("3", &["pages"]), false)
            .await
            .unwrap();
        assert!(entry.tab_of_type(TabType::Files).is_none());
        assert_eq!(entry.files.len(), 2);
    }

    #[tokio::test]
    async fn test_use_cache_is_forwarded() {
        let (composer, api) = composer(FakeCourseApi::default());
        composer.compose_entry(&course("4", &[]), true).await.unwrap();
        assert_eq!(api.calls(), vec!["get_files 4 cache=true"]);
    }

    #[tokio::test]
    async fn test_file_fetch_failure_propagates() {
        let mut api = FakeCourseApi::default();
        api.file_errors.insert("5".to_string(), 500);
        let (composer, _) = composer(api);
        let err = composer
            .compose_entry(&course("5", &["files"]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ComposeError::Files { .. }));
        assert_eq!(err.course_id(), "5");
    }

    #[tokio::test]
    async fn test_compose_course_fetches_descriptor() {
        let api = FakeCourseApi::default().with_course(course("6", &["pages"]), Vec::new());
        let (composer, _) = composer(api);
        let entry = composer.compose_course("6", false).await.unwrap();
        assert_eq!(entry.id, "courses/6");

        let err = composer.compose_course("missing", false).await.unwrap_err();
        assert!(matches!(err, ComposeError::Course { .. }));
    }

    #[test]
    fn test_unknown_hidden_and_duplicate_tabs_dropped() {
        let mut descriptor = course("7", &["collaborations", "pages", "pages", "home"]);
        descriptor.tabs.push(
            serde_json::from_value(serde_json::json!({"id": "quizzes", "label": "Quizzes", "hidden": true}))
                .unwrap(),
        );
        let entry = build_entry(&descriptor, &[]);
        let types: Vec<TabType> = entry.tabs.iter().map(|t| t.tab_type).collect();
        assert_eq!(types, vec![TabType::Pages, TabType::AdditionalContent]);
    }

    #[test]
    fn test_locked_and_hidden_files_excluded() {
        let mut locked = remote_file("1", 1);
        locked.locked_for_user = true;
        let mut hidden = remote_file("2", 1);
        hidden.hidden_for_user = true;
        let entry = build_entry(&course("8", &[]), &[locked, hidden, remote_file("3", 1)]);
        assert_eq!(entry.files.len(), 1);
        assert_eq!(entry.files[0].file_id, "3");
    }
}
