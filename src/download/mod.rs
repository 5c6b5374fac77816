//! Download orchestrator: runs every selected course with bounded
//! concurrency, streams selected files to disk, fetches tab content, and
//! funnels all progress through the single [`writer::ProgressWriter`].
//!
//! Courses run in parallel (bounded), and within a course the content tabs,
//! the file transfers and the front page run side by side. Workers never
//! touch the stores directly.

pub mod error;
pub(crate) mod writer;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future;
use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

pub use error::DownloadError;

use crate::api::{ApiError, CourseApi, DownloadRequest, ModuleTarget};
use crate::model::{DownloadState, SyncEntry, SyncFile, TabType};
use crate::state::{ProgressStore, FILE_DOWNLOAD_FAILED};
use writer::{ItemRef, ProgressEvent, ProgressWriter, WriterHandle};

/// Aggregate error recorded when a run is cancelled.
pub const CANCELLED_ERROR: &str = "Offline sync was cancelled.";

/// Subset of application config consumed by the orchestrator.
/// Decoupled from CLI parsing so the engine can be tested independently.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub(crate) course_concurrency: usize,
    pub(crate) file_concurrency: usize,
    /// Minimum spacing between durable byte-progress writes per file.
    pub(crate) progress_interval: Duration,
    pub(crate) no_progress_bar: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            course_concurrency: 3,
            file_concurrency: 6,
            progress_interval: Duration::from_millis(300),
            no_progress_bar: false,
        }
    }
}

/// Result of one sync run.
#[derive(Debug)]
pub struct SyncOutcome {
    /// Every entry passed in, with final download states.
    pub entries: Vec<SyncEntry>,
    pub interrupted: bool,
    /// Error stored on the aggregate, if any.
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn downloaded_files(&self) -> usize {
        self.count_files(DownloadState::Downloaded)
    }

    pub fn failed_files(&self) -> usize {
        self.count_files(DownloadState::Error)
    }

    fn count_files(&self, state: DownloadState) -> usize {
        self.entries
            .iter()
            .flat_map(|e| e.selected_files())
            .filter(|f| f.state == state)
            .count()
    }
}

/// Where a content fetch reports its result.
#[derive(Debug, Clone, PartialEq)]
enum Target {
    Tab(String),
    AdditionalContent,
}

#[derive(Debug, Clone)]
struct ContentJob {
    tab: TabType,
    target: Target,
}

/// Work for one course, derived from its entry before the writer takes
/// ownership of the tree.
#[derive(Debug, Clone)]
struct CoursePlan {
    entry_id: String,
    course_id: String,
    content: Vec<ContentJob>,
    clean_tabs: Vec<TabType>,
    files: Vec<SyncFile>,
    files_target: Option<Target>,
    front_page: bool,
}

impl CoursePlan {
    fn from_entry(entry: &SyncEntry) -> Self {
        let full = entry.is_full_content_sync();
        let mut content = Vec::new();
        let mut clean_tabs = Vec::new();

        for tab_type in TabType::OFFLINE_SYNCABLE.iter().filter(|t| t.is_content()) {
            match entry.tab_of_type(*tab_type) {
                Some(tab) if tab.selection_state.is_any() => content.push(ContentJob {
                    tab: *tab_type,
                    target: Target::Tab(tab.id.clone()),
                }),
                Some(_) => clean_tabs.push(*tab_type),
                None if full => content.push(ContentJob {
                    tab: *tab_type,
                    target: Target::AdditionalContent,
                }),
                None => {}
            }
        }

        let files_target = match entry.tab_of_type(TabType::Files) {
            Some(tab) if tab.selection_state.is_any() => Some(Target::Tab(tab.id.clone())),
            _ if full => Some(Target::AdditionalContent),
            _ => None,
        };

        let pages_selected = entry
            .tab_of_type(TabType::Pages)
            .is_some_and(|t| t.selection_state.is_any());

        Self {
            entry_id: entry.id.clone(),
            course_id: entry.course_id().to_string(),
            content,
            clean_tabs,
            files: entry.selected_files().cloned().collect(),
            files_target,
            front_page: entry.has_front_page && !pages_selected,
        }
    }
}

/// Reset download states for a fresh run: selected nodes start loading,
/// everything else is not started.
fn prepare_entry(mut entry: SyncEntry) -> SyncEntry {
    let start = |selected: bool| {
        if selected {
            DownloadState::Loading(None)
        } else {
            DownloadState::NotStarted
        }
    };
    entry.state = start(entry.selection_state.is_any());
    for tab in &mut entry.tabs {
        tab.state = start(tab.selection_state.is_any());
    }
    for file in &mut entry.files {
        file.state = start(file.is_selected());
        file.bytes_downloaded = 0;
    }
    entry
}

/// Mark anything still loading as failed.
fn fail_loading(entry: &mut SyncEntry) {
    let fail = |state: &mut DownloadState| {
        if state.is_loading() {
            *state = DownloadState::Error;
        }
    };
    fail(&mut entry.state);
    entry.tabs.iter_mut().for_each(|t| fail(&mut t.state));
    entry.files.iter_mut().for_each(|f| fail(&mut f.state));
}

/// Create a progress bar with a consistent template.
///
/// Hidden when disabled or when stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

pub struct Orchestrator {
    api: Arc<dyn CourseApi>,
    store: Arc<dyn ProgressStore>,
    config: SyncConfig,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn CourseApi>, store: Arc<dyn ProgressStore>, config: SyncConfig) -> Self {
        Self { api, store, config }
    }

    /// Sync every entry with a selection. Entries without one are returned
    /// untouched.
    ///
    /// Per-file transport failures end up as item `error` states; only
    /// store failures abort the run. Cancelling `cancel` stops all
    /// transfers, fails whatever was in flight and finishes the aggregate
    /// with [`CANCELLED_ERROR`].
    pub async fn run(
        &self,
        entries: Vec<SyncEntry>,
        cancel: CancellationToken,
    ) -> Result<SyncOutcome, DownloadError> {
        let started = Instant::now();
        let (selected, skipped): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.selection_state.is_any());
        let selected: Vec<SyncEntry> = selected.into_iter().map(prepare_entry).collect();

        self.store.clean_up_previous_download_progress().await?;
        self.store.set_initial_loading_state(&selected).await?;
        let seeded = self.store.save_download_progress(&selected).await?;

        let plans: Vec<CoursePlan> = selected.iter().map(CoursePlan::from_entry).collect();
        let total_files: usize = plans.iter().map(|p| p.files.len()).sum();
        tracing::info!(
            courses = plans.len(),
            files = total_files,
            bytes = seeded.bytes_to_download,
            "Starting offline sync"
        );

        let pb = create_progress_bar(self.config.no_progress_bar, total_files as u64);
        let (writer, writer_task) = ProgressWriter::spawn(
            selected,
            self.store.clone(),
            self.config.progress_interval,
        );

        let courses = stream::iter(plans)
            .map(|plan| {
                let writer = writer.clone();
                let pb = pb.clone();
                async move { self.sync_course(plan, &writer, &pb).await }
            })
            .buffer_unordered(self.config.course_concurrency.max(1))
            .collect::<Vec<()>>();

        let interrupted = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = courses => false,
        };

        drop(writer);
        let report = writer_task.await?;
        pb.finish_and_clear();
        if report.write_errors > 0 {
            tracing::warn!(count = report.write_errors, "Some progress writes failed");
        }

        let mut synced = report.entries;
        let error = if interrupted {
            tracing::info!("Sync cancelled, failing in-flight items");
            let failed = self.store.mark_in_progress_downloads_as_failed().await?;
            tracing::debug!(count = failed, "Marked in-progress items as failed");
            self.store
                .save_download_result(true, Some(CANCELLED_ERROR))
                .await?;
            synced.iter_mut().for_each(fail_loading);
            Some(CANCELLED_ERROR.to_string())
        } else {
            let failed = synced.iter().any(SyncEntry::has_error);
            let error = failed.then(|| FILE_DOWNLOAD_FAILED.to_string());
            self.store.save_download_result(true, error.as_deref()).await?;
            error
        };

        let outcome = SyncOutcome {
            entries: synced.into_iter().chain(skipped).collect(),
            interrupted,
            error,
        };
        let downloaded = outcome.downloaded_files();
        let failed = outcome.failed_files();
        tracing::info!("── Summary ──");
        tracing::info!(
            "  {} downloaded, {} failed, {} total",
            downloaded,
            failed,
            total_files
        );
        tracing::info!("  elapsed: {}", format_duration(started.elapsed()));

        Ok(outcome)
    }

    /// Delete local content of courses that are no longer selected.
    /// Returns how many were cleaned; failures are logged.
    pub async fn clean_content(&self, course_ids: &[String]) -> usize {
        let mut cleaned = 0;
        for course_id in course_ids {
            match self.api.clean_content(course_id).await {
                Ok(()) => cleaned += 1,
                Err(e) => {
                    tracing::warn!(course_id = %course_id, error = %e, "Failed to clean course content")
                }
            }
        }
        cleaned
    }

    async fn sync_course(&self, plan: CoursePlan, writer: &WriterHandle, pb: &ProgressBar) {
        tracing::debug!(
            course_id = %plan.course_id,
            tabs = plan.content.len(),
            files = plan.files.len(),
            "Syncing course"
        );
        tokio::join!(
            self.sync_content_tabs(&plan, writer),
            self.sync_files(&plan, writer, pb),
            self.sync_front_page(&plan),
        );
        writer
            .send(ProgressEvent::CourseSettled {
                entry_id: plan.entry_id.clone(),
            })
            .await;
    }

    async fn sync_content_tabs(&self, plan: &CoursePlan, writer: &WriterHandle) {
        let fetches = plan
            .content
            .iter()
            .map(|job| self.sync_content(plan, job, writer));
        // Listings pulled in by module items stay even when their tab is
        // deselected.
        let kept: Vec<TabType> = future::join_all(fetches).await.concat();

        for tab in plan.clean_tabs.iter().filter(|t| !kept.contains(*t)) {
            if let Err(e) = self.api.clean_tab_content(&plan.course_id, *tab).await {
                tracing::warn!(
                    course_id = %plan.course_id,
                    tab = tab.as_str(),
                    error = %e,
                    "Failed to clean deselected tab"
                );
            }
        }
    }

    /// Fetch one content tab and report its state. Returns the extra tab
    /// listings fetched on behalf of module items.
    async fn sync_content(
        &self,
        plan: &CoursePlan,
        job: &ContentJob,
        writer: &WriterHandle,
    ) -> Vec<TabType> {
        let (result, fetched) = match job.tab {
            TabType::Modules => self.sync_modules(plan).await,
            tab => (self.api.get_tab_content(&plan.course_id, tab).await, Vec::new()),
        };
        let success = match result {
            Ok(()) => true,
            // Hidden or restricted tabs answer 401/403/404; nothing to store.
            Err(e) if e.is_non_fatal() => {
                tracing::debug!(course_id = %plan.course_id, tab = job.tab.as_str(), error = %e, "Tab not accessible");
                true
            }
            Err(e) => {
                tracing::warn!(course_id = %plan.course_id, tab = job.tab.as_str(), error = %e, "Tab sync failed");
                false
            }
        };

        match &job.target {
            Target::Tab(tab_id) => {
                let state = if success {
                    DownloadState::Downloaded
                } else {
                    DownloadState::Error
                };
                writer
                    .set_state(&plan.entry_id, ItemRef::Tab(tab_id.clone()), state)
                    .await;
            }
            Target::AdditionalContent => {
                writer
                    .send(ProgressEvent::AdditionalResult {
                        entry_id: plan.entry_id.clone(),
                        success,
                    })
                    .await;
            }
        }
        fetched
    }

    /// Store the module structure, then whatever its items point at:
    /// listings of other tabs, single pages and single files.
    ///
    /// Items the user cannot access are skipped. The first other failure
    /// fails the modules tab after every item has been tried.
    async fn sync_modules(&self, plan: &CoursePlan) -> (Result<(), ApiError>, Vec<TabType>) {
        let course_id = plan.course_id.as_str();
        let items = match self.api.get_module_items(course_id).await {
            Ok(items) => items,
            Err(e) => return (Err(e), Vec::new()),
        };

        let mut list_tabs: Vec<TabType> = Vec::new();
        let mut targets: Vec<ModuleTarget> = Vec::new();
        for item in &items {
            if let Some(tab) = item.list_tab() {
                let planned = plan.content.iter().any(|job| job.tab == tab);
                if !planned && !list_tabs.contains(&tab) {
                    list_tabs.push(tab);
                }
            }
            if let Some(target) = item.target() {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        tracing::debug!(
            course_id = %course_id,
            items = items.len(),
            tabs = list_tabs.len(),
            targets = targets.len(),
            "Syncing module items"
        );

        let tab_fetches = list_tabs
            .iter()
            .map(|tab| self.api.get_tab_content(course_id, *tab));
        let mut results = future::join_all(tab_fetches).await;
        let item_results: Vec<Result<(), ApiError>> = stream::iter(&targets)
            .map(|target| async move {
                match target {
                    ModuleTarget::Page(page_url) => {
                        self.api.get_module_page(course_id, page_url).await
                    }
                    ModuleTarget::File(file_id) => {
                        self.api.get_module_file(course_id, file_id).await
                    }
                }
            })
            .buffer_unordered(self.config.file_concurrency.max(1))
            .collect()
            .await;
        results.extend(item_results);

        let mut failure = None;
        for e in results.into_iter().filter_map(Result::err) {
            if e.is_non_fatal() {
                tracing::debug!(course_id = %course_id, error = %e, "Module item not accessible");
            } else {
                tracing::warn!(course_id = %course_id, error = %e, "Module item sync failed");
                failure.get_or_insert(e);
            }
        }
        (failure.map_or(Ok(()), Err), list_tabs)
    }

    async fn sync_files(&self, plan: &CoursePlan, writer: &WriterHandle, pb: &ProgressBar) {
        let results: Vec<Result<(), DownloadError>> = stream::iter(&plan.files)
            .map(|file| self.transfer_file(plan, file, writer, pb))
            .buffer_unordered(self.config.file_concurrency.max(1))
            .collect()
            .await;

        let failures = results.iter().filter(|r| r.is_err()).count();
        match &plan.files_target {
            Some(Target::Tab(_)) => {
                writer
                    .send(ProgressEvent::FilesSettled {
                        entry_id: plan.entry_id.clone(),
                    })
                    .await;
            }
            Some(Target::AdditionalContent) => {
                writer
                    .send(ProgressEvent::AdditionalResult {
                        entry_id: plan.entry_id.clone(),
                        success: failures == 0,
                    })
                    .await;
            }
            None => {}
        }

        let keep: Vec<String> = plan.files.iter().map(|f| f.file_id.clone()).collect();
        if let Err(e) = self
            .api
            .remove_unavailable_files(&plan.course_id, &keep)
            .await
        {
            tracing::warn!(course_id = %plan.course_id, error = %e, "Failed to prune unavailable files");
        }
    }

    /// Stream one file, forwarding byte progress to the writer.
    /// No automatic retry: a failed file stays failed until reselected.
    async fn transfer_file(
        &self,
        plan: &CoursePlan,
        file: &SyncFile,
        writer: &WriterHandle,
        pb: &ProgressBar,
    ) -> Result<(), DownloadError> {
        tracing::debug!(
            course_id = %plan.course_id,
            file_id = %file.file_id,
            mime_class = %file.mime_class,
            size_bytes = file.bytes_to_download,
            "downloading",
        );
        let mut progress = self.api.download_file(DownloadRequest {
            course_id: plan.course_id.clone(),
            url: file.url.clone(),
            file_id: file.file_id.clone(),
            file_name: file.file_name.clone(),
            updated_at: file.updated_at,
            expected_size: file.bytes_to_download,
        });

        let mut result = Ok(());
        while let Some(item) = progress.next().await {
            match item {
                Ok(p) => {
                    writer
                        .send(ProgressEvent::FileBytes {
                            entry_id: plan.entry_id.clone(),
                            file_id: file.id.clone(),
                            progress: p,
                        })
                        .await;
                }
                Err(source) => {
                    result = Err(DownloadError::Transport {
                        file_id: file.file_id.clone(),
                        source,
                    });
                    break;
                }
            }
        }

        let state = match &result {
            Ok(()) => DownloadState::Downloaded,
            Err(e) => {
                pb.suspend(|| tracing::error!("Download failed: {}", e));
                DownloadState::Error
            }
        };
        writer
            .set_state(&plan.entry_id, ItemRef::File(file.id.clone()), state)
            .await;
        pb.set_message(file.display_name.clone());
        pb.inc(1);
        result
    }

    /// Best effort; failures never affect course state.
    async fn sync_front_page(&self, plan: &CoursePlan) {
        if !plan.front_page {
            return;
        }
        if let Err(e) = self.api.get_front_page(&plan.course_id).await {
            tracing::debug!(course_id = %plan.course_id, error = %e, "Front page not stored");
        }
    }
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
