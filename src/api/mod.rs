//! Remote course API seam.
//!
//! The engine only talks to [`CourseApi`]; [`http::CanvasClient`] is the
//! production implementation and tests provide in-memory fakes.

pub mod error;
pub mod html;
pub mod http;
pub mod layout;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize};

pub use error::ApiError;
pub use http::CanvasClient;
pub use layout::OfflineLayout;

use crate::model::TabType;

/// Byte progress of one file transfer. The stream ends after the last chunk;
/// an `Err` item ends it early.
pub type ProgressStream = BoxStream<'static, Result<DownloadProgress, ApiError>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.bytes_downloaded as f64 / total as f64).clamp(0.0, 1.0))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub course_id: String,
    pub url: String,
    pub file_id: String,
    pub file_name: String,
    pub updated_at: Option<DateTime<Utc>>,
    /// Size announced by the file listing; used when the response has no
    /// content length.
    pub expected_size: u64,
}

#[async_trait]
pub trait CourseApi: Send + Sync {
    /// Course metadata including its visible tabs.
    async fn get_course(&self, course_id: &str) -> Result<CourseDescriptor, ApiError>;

    /// Every file of the course. With `use_cache` a previous listing may be
    /// served instead of hitting the network.
    async fn get_files(
        &self,
        course_id: &str,
        use_cache: bool,
    ) -> Result<Vec<FileDescriptor>, ApiError>;

    /// Delete local copies of files not listed in `new_file_ids`.
    async fn remove_unavailable_files(
        &self,
        course_id: &str,
        new_file_ids: &[String],
    ) -> Result<(), ApiError>;

    fn download_file(&self, request: DownloadRequest) -> ProgressStream;

    /// Fetch and store the content behind one tab.
    async fn get_tab_content(&self, course_id: &str, tab: TabType) -> Result<(), ApiError>;

    /// Fetch and store the course's front page.
    async fn get_front_page(&self, course_id: &str) -> Result<(), ApiError>;

    /// Fetch and store the modules tab, returning every module item.
    async fn get_module_items(
        &self,
        course_id: &str,
    ) -> Result<Vec<ModuleItemDescriptor>, ApiError>;

    /// Fetch and store a page referenced by a module item.
    async fn get_module_page(&self, course_id: &str, page_url: &str) -> Result<(), ApiError>;

    /// Download a file referenced by a module item.
    async fn get_module_file(&self, course_id: &str, file_id: &str) -> Result<(), ApiError>;

    /// Delete stored content of one tab.
    async fn clean_tab_content(&self, course_id: &str, tab: TabType) -> Result<(), ApiError>;

    /// Delete all offline content of a course.
    async fn clean_content(&self, course_id: &str) -> Result<(), ApiError>;
}

/// Canvas ids arrive as numbers or strings depending on the endpoint.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(u64),
    Str(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Num(n) => n.to_string(),
            RawId::Str(s) => s,
        }
    }
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(RawId::deserialize(deserializer)?.into_string())
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(RawId::into_string))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CourseDescriptor {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub default_view: Option<String>,
    #[serde(default)]
    pub tabs: Vec<TabDescriptor>,
}

impl CourseDescriptor {
    /// Courses whose home is a wiki page expose a front page.
    pub fn has_front_page(&self) -> bool {
        self.default_view.as_deref() == Some("wiki")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabDescriptor {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub display_name: String,
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mime_class: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locked_for_user: bool,
    #[serde(default)]
    pub hidden_for_user: bool,
}

impl FileDescriptor {
    pub fn is_available(&self) -> bool {
        !self.locked_for_user && !self.hidden_for_user
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleDescriptor {
    #[serde(default)]
    pub items: Vec<ModuleItemDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModuleItemDescriptor {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub content_id: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
}

/// Content a module item needs fetched on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleTarget {
    Page(String),
    File(String),
}

impl ModuleItemDescriptor {
    /// Tab whose listing already carries this item's content.
    pub fn list_tab(&self) -> Option<TabType> {
        match self.item_type.as_str() {
            "Assignment" => Some(TabType::Assignments),
            "Discussion" => Some(TabType::Discussions),
            "Quiz" => Some(TabType::Quizzes),
            _ => None,
        }
    }

    /// Pages and files are fetched one by one.
    pub fn target(&self) -> Option<ModuleTarget> {
        match self.item_type.as_str() {
            "Page" => self.page_url.clone().map(ModuleTarget::Page),
            "File" => self.content_id.clone().map(ModuleTarget::File),
            _ => None,
        }
    }
}
