//! Canvas REST implementation of [`CourseApi`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, AUTHORIZATION, LINK};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::error::ApiError;
use super::html;
use super::layout::{file_id_of_dir, OfflineLayout};
use super::{
    CourseApi, CourseDescriptor, DownloadProgress, DownloadRequest, FileDescriptor,
    ModuleDescriptor, ModuleItemDescriptor, ProgressStream,
};
use crate::model::TabType;
use crate::retry::{self, RetryAction, RetryConfig};

const PAGE_SIZE: u32 = 100;

/// Embedded images and attachments fetched at once per document.
const EMBED_CONCURRENCY: usize = 5;

pub struct CanvasClient {
    client: Client,
    base_url: String,
    /// `base_url` parsed; resolves relative links in stored HTML.
    base: Option<Url>,
    token: String,
    layout: OfflineLayout,
    retry: RetryConfig,
}

impl std::fmt::Debug for CanvasClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasClient")
            .field("base_url", &self.base_url)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl CanvasClient {
    pub fn new(
        client: Client,
        base_url: &str,
        token: String,
        layout: OfflineLayout,
        retry: RetryConfig,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            client,
            base: Url::parse(&format!("{base_url}/")).ok(),
            base_url,
            token,
            layout,
            retry,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET one page, retrying transient failures. Returns the decoded body
    /// and the `rel="next"` link if there is one.
    async fn get_page<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<(T, Option<String>), ApiError> {
        retry::retry_with_backoff(
            &self.retry,
            |e: &ApiError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || async {
                let response = self
                    .client
                    .get(url)
                    .header(AUTHORIZATION, format!("Bearer {}", self.token))
                    .send()
                    .await
                    .map_err(|e| ApiError::Transport {
                        url: url.to_string(),
                        source: e,
                    })?;

                let status = response.status();
                if !status.is_success() {
                    return Err(ApiError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }

                let next = next_link(response.headers());
                let body = response.bytes().await.map_err(|e| ApiError::Transport {
                    url: url.to_string(),
                    source: e,
                })?;
                let value = serde_json::from_slice(&body).map_err(|e| ApiError::Json {
                    url: url.to_string(),
                    source: e,
                })?;
                Ok((value, next))
            },
        )
        .await
    }

    /// Follow pagination, returning every page's JSON value in order.
    async fn get_all_pages(&self, first: String) -> Result<Vec<serde_json::Value>, ApiError> {
        let mut pages = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next {
            let (page, link): (serde_json::Value, _) = self.get_page(&url).await?;
            pages.push(page);
            next = link;
        }
        Ok(pages)
    }

    /// Listing stored by an earlier [`CourseApi::get_files`] call, possibly
    /// from another process. Unreadable listings count as missing.
    async fn cached_files(&self, course_id: &str) -> Option<Vec<FileDescriptor>> {
        let path = self.layout.file_listing_path(course_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), error = %e, "Cannot read cached file list");
                }
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(files) => Some(files),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt cached file list");
                None
            }
        }
    }

    async fn store_files(&self, course_id: &str, files: &[FileDescriptor]) {
        let path = self.layout.file_listing_path(course_id);
        let result = match serde_json::to_value(files) {
            Ok(document) => write_json(&path, &document).await,
            Err(e) => Err(ApiError::Malformed(e.to_string())),
        };
        if let Err(e) = result {
            tracing::warn!(course_id = %course_id, error = %e, "Failed to cache file list");
        }
    }

    fn is_own_host(&self, url: &Url) -> bool {
        self.base.as_ref().is_some_and(|base| {
            base.host_str() == url.host_str() && base.port_or_known_default() == url.port_or_known_default()
        })
    }

    /// Fetch the images and attachments referenced by the document's HTML
    /// into the course's embedded directory and point the HTML at them.
    ///
    /// `link_prefix` leads from the stored document to the course dir.
    /// References that cannot be fetched keep their online URL.
    async fn localize_document(
        &self,
        course_id: &str,
        document: &mut serde_json::Value,
        link_prefix: &str,
    ) {
        let Some(base) = self.base.as_ref() else {
            return;
        };
        let mut links: Vec<html::EmbeddedLink> = Vec::new();
        for fragment in html::html_fragments(document) {
            for link in html::embedded_links(fragment) {
                if !links.iter().any(|l| l.raw == link.raw) {
                    links.push(link);
                }
            }
        }
        if links.is_empty() {
            return;
        }

        let dir = self.layout.embedded_dir(course_id);
        let dir = &dir;
        let replacements: Vec<(String, String)> = stream::iter(links)
            .map(|link| async move {
                let url = link.fetch_url(base)?;
                let name = html::local_name(&url);
                match self.fetch_embedded(&url, &dir.join(&name)).await {
                    Ok(()) => Some((link.raw, format!("{link_prefix}embedded/{name}"))),
                    Err(e) => {
                        tracing::warn!(course_id = %course_id, url = %url, error = %e, "Embedded resource not stored");
                        None
                    }
                }
            })
            .buffer_unordered(EMBED_CONCURRENCY)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        tracing::debug!(course_id = %course_id, count = replacements.len(), "Localized embedded resources");
        html::rewrite_fragments(document, &replacements);
    }

    /// Download one embedded resource unless a copy already exists.
    /// The API token is only sent to the Canvas host itself.
    async fn fetch_embedded(&self, url: &Url, target: &Path) -> Result<(), ApiError> {
        if fs::try_exists(target).await.unwrap_or(false) {
            return Ok(());
        }
        let mut request = self.client.get(url.clone());
        if self.is_own_host(url) {
            request = request.header(AUTHORIZATION, format!("Bearer {}", self.token));
        }
        let response = request.send().await.map_err(|e| ApiError::Transport {
            url: url.to_string(),
            source: e,
        })?;
        if !response.status().is_success() {
            return Err(ApiError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.bytes().await.map_err(|e| ApiError::Transport {
            url: url.to_string(),
            source: e,
        })?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let part = part_path(target);
        fs::write(&part, &body).await?;
        fs::rename(&part, target).await?;
        Ok(())
    }
}

/// REST path that lists a tab's content.
fn tab_endpoint(course_id: &str, tab: TabType) -> Option<String> {
    let path = match tab {
        TabType::Assignments => format!("courses/{course_id}/assignments"),
        TabType::Announcements => {
            format!("announcements?context_codes[]=course_{course_id}")
        }
        TabType::Discussions => format!("courses/{course_id}/discussion_topics"),
        TabType::Grades => format!(
            "courses/{course_id}/assignment_groups?include[]=assignments&include[]=submission"
        ),
        TabType::Modules => format!("courses/{course_id}/modules?include[]=items"),
        TabType::Pages => format!("courses/{course_id}/pages?include[]=body"),
        TabType::People => format!("courses/{course_id}/users"),
        TabType::Quizzes => format!("courses/{course_id}/quizzes"),
        TabType::Syllabus => format!("courses/{course_id}?include[]=syllabus_body"),
        TabType::Files | TabType::AdditionalContent => return None,
    };
    Some(path)
}

fn with_page_size(url: String) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}per_page={PAGE_SIZE}")
}

/// Extract the `rel="next"` target from a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(LINK)?.to_str().ok()?;
    value.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| p.trim() == r#"rel="next""#);
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// Merge pages into one JSON document: arrays are concatenated, a single
/// object response is stored as-is.
fn merge_pages(mut pages: Vec<serde_json::Value>) -> serde_json::Value {
    if pages.len() == 1 && !pages[0].is_array() {
        return pages.remove(0);
    }
    let items = pages
        .into_iter()
        .flat_map(|page| match page {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        })
        .collect();
    serde_json::Value::Array(items)
}

async fn write_json(target: &Path, document: &serde_json::Value) -> Result<(), ApiError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    let bytes =
        serde_json::to_vec_pretty(document).map_err(|e| ApiError::Malformed(e.to_string()))?;
    fs::write(target, bytes).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), ApiError> {
    let result = match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn part_path(path: &Path) -> PathBuf {
    path.with_file_name(format!(
        "{}.part",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ))
}

/// What the file listing said about a file when its local copy was
/// written. Stored next to the copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FileStamp {
    size: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl FileStamp {
    fn of(request: &DownloadRequest) -> Self {
        Self {
            size: request.expected_size,
            updated_at: request.updated_at,
        }
    }
}

fn stamp_path(path: &Path) -> PathBuf {
    path.with_file_name(".stamp.json")
}

/// Length of the local copy when it matches the listing in both size and
/// modification time.
async fn current_copy_len(path: &Path, request: &DownloadRequest) -> Option<u64> {
    let bytes = fs::read(stamp_path(path)).await.ok()?;
    let stamp: FileStamp = serde_json::from_slice(&bytes).ok()?;
    if stamp != FileStamp::of(request) {
        return None;
    }
    let len = fs::metadata(path).await.ok()?.len();
    (request.expected_size == 0 || len == request.expected_size).then_some(len)
}

async fn write_stamp(path: &Path, request: &DownloadRequest) -> Result<(), ApiError> {
    let bytes = serde_json::to_vec(&FileStamp::of(request))
        .map_err(|e| ApiError::Malformed(e.to_string()))?;
    fs::write(stamp_path(path), bytes).await?;
    Ok(())
}

/// Stream one file to disk, reporting progress on `tx`.
///
/// Writes to a `.part` sibling and renames on completion, then records the
/// listing's size and `updated_at` next to the copy. A copy whose record
/// matches the request is reported as complete without a request. Returns
/// early when the receiver is gone.
async fn stream_to_disk(
    client: &Client,
    token: &str,
    request: &DownloadRequest,
    path: &Path,
    tx: &mpsc::Sender<Result<DownloadProgress, ApiError>>,
) -> Result<(), ApiError> {
    if let Some(len) = current_copy_len(path, request).await {
        tracing::debug!(path = %path.display(), "Local copy up to date");
        let _ = tx
            .send(Ok(DownloadProgress {
                bytes_downloaded: len,
                total_bytes: Some(len),
            }))
            .await;
        return Ok(());
    }

    let response = client
        .get(&request.url)
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .send()
        .await
        .map_err(|e| ApiError::Transport {
            url: request.url.clone(),
            source: e,
        })?;
    if !response.status().is_success() {
        return Err(ApiError::HttpStatus {
            status: response.status().as_u16(),
            url: request.url.clone(),
        });
    }

    let total_bytes = response
        .content_length()
        .or((request.expected_size > 0).then_some(request.expected_size));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let part_path = part_path(path);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&part_path)
        .await?;

    let mut bytes_downloaded: u64 = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ApiError::Transport {
            url: request.url.clone(),
            source: e,
        })?;
        file.write_all(&chunk).await?;
        bytes_downloaded += chunk.len() as u64;

        let progress = DownloadProgress {
            bytes_downloaded,
            total_bytes,
        };
        if tx.send(Ok(progress)).await.is_err() {
            drop(file);
            let _ = fs::remove_file(&part_path).await;
            tracing::debug!(file_id = %request.file_id, "Download abandoned by receiver");
            return Ok(());
        }
    }
    file.flush().await?;
    drop(file);

    fs::rename(&part_path, path).await?;
    if let Err(e) = write_stamp(path, request).await {
        // The copy is fine; without a stamp it is fetched again next run.
        tracing::warn!(path = %path.display(), error = %e, "Failed to record file stamp");
    }
    Ok(())
}

/// Stream a file to `path` when nobody watches its progress.
async fn download_quietly(
    client: &Client,
    token: &str,
    request: &DownloadRequest,
    path: &Path,
) -> Result<(), ApiError> {
    let (tx, mut rx) = mpsc::channel(16);
    let transfer = async {
        let tx = tx;
        stream_to_disk(client, token, request, path, &tx).await
    };
    let drain = async { while rx.recv().await.is_some() {} };
    let (result, ()) = tokio::join!(transfer, drain);
    result
}

#[async_trait]
impl CourseApi for CanvasClient {
    async fn get_course(&self, course_id: &str) -> Result<CourseDescriptor, ApiError> {
        let url = self.api_url(&format!("courses/{course_id}?include[]=tabs"));
        let (course, _): (CourseDescriptor, _) = self.get_page(&url).await?;
        Ok(course)
    }

    async fn get_files(
        &self,
        course_id: &str,
        use_cache: bool,
    ) -> Result<Vec<FileDescriptor>, ApiError> {
        if use_cache {
            if let Some(files) = self.cached_files(course_id).await {
                tracing::debug!(course_id = %course_id, count = files.len(), "Using cached file list");
                return Ok(files);
            }
        }

        let mut files: Vec<FileDescriptor> = Vec::new();
        let mut next = Some(with_page_size(self.api_url(&format!("courses/{course_id}/files"))));
        while let Some(url) = next {
            let (page, link): (Vec<FileDescriptor>, _) = self.get_page(&url).await?;
            files.extend(page);
            next = link;
        }

        tracing::debug!(course_id = %course_id, count = files.len(), "Fetched file list");
        self.store_files(course_id, &files).await;
        Ok(files)
    }

    async fn remove_unavailable_files(
        &self,
        course_id: &str,
        new_file_ids: &[String],
    ) -> Result<(), ApiError> {
        let dir = self.layout.files_dir(course_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let keep: HashSet<&str> = new_file_ids.iter().map(String::as_str).collect();
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(file_id) = file_id_of_dir(&name) else {
                continue;
            };
            if !keep.contains(file_id) {
                remove_if_exists(&entry.path()).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(course_id = %course_id, removed, "Removed unavailable files");
        }
        Ok(())
    }

    fn download_file(&self, request: DownloadRequest) -> ProgressStream {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        let token = self.token.clone();
        let path = self
            .layout
            .file_path(&request.course_id, &request.file_id, &request.file_name);

        tokio::spawn(async move {
            if let Err(e) = stream_to_disk(&client, &token, &request, &path, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
        .boxed()
    }

    async fn get_tab_content(&self, course_id: &str, tab: TabType) -> Result<(), ApiError> {
        let path = tab_endpoint(course_id, tab).ok_or_else(|| {
            ApiError::Malformed(format!("tab '{}' has no content endpoint", tab.as_str()))
        })?;
        let pages = self.get_all_pages(with_page_size(self.api_url(&path))).await?;
        let mut document = merge_pages(pages);
        self.localize_document(course_id, &mut document, "").await;
        write_json(&self.layout.tab_path(course_id, tab), &document).await?;
        tracing::debug!(course_id = %course_id, tab = tab.as_str(), "Stored tab content");
        Ok(())
    }

    async fn get_front_page(&self, course_id: &str) -> Result<(), ApiError> {
        let url = self.api_url(&format!("courses/{course_id}/front_page"));
        let (mut page, _) = self.get_page::<serde_json::Value>(&url).await?;
        self.localize_document(course_id, &mut page, "").await;
        write_json(&self.layout.front_page_path(course_id), &page).await?;
        tracing::debug!(course_id = %course_id, "Stored front page");
        Ok(())
    }

    async fn get_module_items(
        &self,
        course_id: &str,
    ) -> Result<Vec<ModuleItemDescriptor>, ApiError> {
        let first = with_page_size(self.api_url(&format!("courses/{course_id}/modules?include[]=items")));
        let pages = self.get_all_pages(first.clone()).await?;
        let document = merge_pages(pages);
        write_json(&self.layout.tab_path(course_id, TabType::Modules), &document).await?;

        let modules: Vec<ModuleDescriptor> =
            serde_json::from_value(document).map_err(|e| ApiError::Json {
                url: first,
                source: e,
            })?;
        let items: Vec<ModuleItemDescriptor> =
            modules.into_iter().flat_map(|m| m.items).collect();
        tracing::debug!(course_id = %course_id, items = items.len(), "Stored modules");
        Ok(items)
    }

    async fn get_module_page(&self, course_id: &str, page_url: &str) -> Result<(), ApiError> {
        let url = self.api_url(&format!("courses/{course_id}/pages/{page_url}"));
        let (mut page, _) = self.get_page::<serde_json::Value>(&url).await?;
        self.localize_document(course_id, &mut page, "../").await;
        write_json(&self.layout.module_page_path(course_id, page_url), &page).await?;
        Ok(())
    }

    async fn get_module_file(&self, course_id: &str, file_id: &str) -> Result<(), ApiError> {
        let url = self.api_url(&format!("courses/{course_id}/files/{file_id}"));
        let (file, _) = self.get_page::<FileDescriptor>(&url).await?;
        if !file.is_available() {
            tracing::debug!(course_id = %course_id, file_id = %file_id, "Module file is locked");
            return Ok(());
        }
        let request = DownloadRequest {
            course_id: course_id.to_string(),
            url: file.url,
            file_id: file.id,
            file_name: file.filename,
            updated_at: file.updated_at,
            expected_size: file.size,
        };
        let path = self
            .layout
            .module_file_path(course_id, &request.file_id, &request.file_name);
        download_quietly(&self.client, &self.token, &request, &path).await
    }

    async fn clean_tab_content(&self, course_id: &str, tab: TabType) -> Result<(), ApiError> {
        if tab == TabType::Modules {
            remove_if_exists(&self.layout.modules_dir(course_id)).await?;
        }
        remove_if_exists(&self.layout.tab_path(course_id, tab)).await
    }

    async fn clean_content(&self, course_id: &str) -> Result<(), ApiError> {
        remove_if_exists(&self.layout.course_dir(course_id)).await
    }
}
