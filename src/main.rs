//! course-sync: offline course-content synchronization.
//!
//! Users select courses, tabs or single files; `sync` downloads everything
//! selected from a Canvas-style REST API into a local content directory and
//! tracks per-item progress in SQLite so an interrupted run can be observed
//! and recovered after a restart.

#![warn(clippy::all)]

mod api;
mod cli;
mod compose;
mod config;
mod download;
mod model;
mod notify;
mod observe;
mod recovery;
pub mod retry;
mod shutdown;
mod state;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::stream::{self, StreamExt};
use tracing_subscriber::EnvFilter;

use api::{CanvasClient, CourseApi, OfflineLayout};
use cli::Command;
use compose::EntryComposer;
use config::{ApiConfig, Config, Paths};
use download::Orchestrator;
use model::{apply_selections, file_id, selected_course_ids, tab_id, DownloadState, TabType};
use notify::{CompletionNotifier, LogNotificationSink, NotificationOutcome, NotifyError};
use observe::{course_summaries, ProgressObserver, StoreObserver};
use state::{ProgressStore, RunLock, SqliteProgressStore};

async fn open_store(db_path: &Path) -> anyhow::Result<Arc<SqliteProgressStore>> {
    Ok(Arc::new(SqliteProgressStore::open(db_path).await?))
}

/// Repair whatever a dead process left behind. Callers hold the
/// [`RunLock`], so no live sync owns the `loading` records.
async fn recover_interrupted(store: &dyn ProgressStore, _lock: &RunLock) -> anyhow::Result<()> {
    let report = recovery::run_sweep(store).await?;
    if report.run_interrupted {
        tracing::warn!("The previous sync did not finish; its unfinished items were marked failed");
    }
    Ok(())
}

/// Tell the user how the run ended. The progress bar is cleared by the
/// time this runs, so it never suppresses the notification.
async fn notify_completion(
    notifier: &CompletionNotifier,
    interrupted: bool,
) -> Result<NotificationOutcome, NotifyError> {
    if interrupted {
        notifier.send_failed_notification().await
    } else {
        notifier.send(false).await
    }
}

fn build_api(api: &ApiConfig, paths: &Paths, retry: retry::RetryConfig) -> anyhow::Result<CanvasClient> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;
    Ok(CanvasClient::new(
        client,
        &api.base_url,
        api.token.clone(),
        OfflineLayout::new(&paths.content_dir),
        retry,
    ))
}

/// Run the select command.
async fn run_select(paths: Paths, args: cli::SelectArgs) -> anyhow::Result<()> {
    let course = args.course.trim();
    if course.is_empty() {
        anyhow::bail!("Course id must not be empty");
    }

    let mut keys = Vec::new();
    for tab in &args.tabs {
        let Some(tab_type) = TabType::from_str(tab).filter(|t| TabType::OFFLINE_SYNCABLE.contains(t))
        else {
            let known: Vec<&str> = TabType::OFFLINE_SYNCABLE.iter().map(|t| t.as_str()).collect();
            anyhow::bail!("Unknown tab '{}'. Syncable tabs: {}", tab, known.join(", "));
        };
        keys.push(tab_id(course, tab_type));
    }
    keys.extend(args.files.iter().map(|f| file_id(course, f)));
    if keys.is_empty() {
        keys.push(model::entry_id(course));
    }

    let store = open_store(&paths.db_path).await?;
    store.save_selections(&keys).await?;
    for key in &keys {
        println!("Selected {}", key);
    }
    Ok(())
}

/// Run the deselect command. Content is removed right away unless a sync
/// is running; that sync or the next one removes it otherwise.
async fn run_deselect(paths: Paths, args: cli::DeselectArgs) -> anyhow::Result<()> {
    let store = open_store(&paths.db_path).await?;
    let removed = store.remove_course_selections(&args.course).await?;

    let _lock = match RunLock::acquire(&paths.db_path).await {
        Ok(lock) => lock,
        Err(state::StateError::Busy { .. }) => {
            println!(
                "Removed {} selection(s) of course {}; its content is removed by the running sync",
                removed, args.course
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let api_config = ApiConfig::from_cli(&args.api)?;
    let api: Arc<dyn CourseApi> = Arc::new(build_api(
        &api_config,
        &paths,
        retry::RetryConfig::default(),
    )?);
    let orchestrator = Orchestrator::new(api, store, download::SyncConfig::default());
    orchestrator.clean_content(&[args.course.clone()]).await;

    println!(
        "Removed {} selection(s) and local content of course {}",
        removed, args.course
    );
    Ok(())
}

/// Replace a course's persisted keys with the canonical set for its
/// composed entry, dropping keys of files and tabs that no longer exist.
async fn refresh_selections(
    store: &dyn ProgressStore,
    entry: &model::SyncEntry,
    keys: &[String],
) -> Result<(), state::StateError> {
    let mut persisted: Vec<&String> = keys
        .iter()
        .filter(|k| model::course_id_of_key(k) == Some(entry.course_id()))
        .collect();
    let canonical = model::selection_keys(entry);
    let mut wanted: Vec<&String> = canonical.iter().collect();
    persisted.sort();
    wanted.sort();
    if persisted == wanted {
        return Ok(());
    }

    tracing::debug!(
        course_id = %entry.course_id(),
        before = persisted.len(),
        after = wanted.len(),
        "Refreshing stored selections"
    );
    store.remove_course_selections(entry.course_id()).await?;
    store.save_selections(&canonical).await
}

/// Run the sync command.
async fn run_sync(config: Config) -> anyhow::Result<()> {
    tracing::debug!(?config, "Resolved sync configuration");
    let lock = RunLock::acquire(&config.paths.db_path).await?;
    tracing::debug!(lock = %lock.path().display(), "Holding run lock");
    let store = open_store(&config.paths.db_path).await?;
    recover_interrupted(store.as_ref(), &lock).await?;

    let keys = store.get_selections().await?;
    let course_ids = selected_course_ids(&keys);

    let canvas = build_api(&config.api, &config.paths, config.retry.clone())?;
    let layout = OfflineLayout::new(&config.paths.content_dir);
    let api: Arc<dyn CourseApi> = Arc::new(canvas);
    let progress_store: Arc<dyn ProgressStore> = store.clone();
    let orchestrator = Orchestrator::new(api.clone(), progress_store.clone(), config.sync.clone());

    match layout.course_ids_on_disk() {
        Ok(on_disk) => {
            let stale: Vec<String> = on_disk
                .into_iter()
                .filter(|id| !course_ids.contains(id))
                .collect();
            if !stale.is_empty() {
                let cleaned = orchestrator.clean_content(&stale).await;
                tracing::info!(count = cleaned, "Removed content of deselected courses");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Could not list offline content"),
    }

    if course_ids.is_empty() {
        println!("Nothing selected. Use `course-sync select <course>` first.");
        return Ok(());
    }

    let composer = EntryComposer::new(api);
    let composed: Vec<_> = stream::iter(&course_ids)
        .map(|id| composer.compose_course(id, config.use_cache))
        .buffer_unordered(config.sync.course_concurrency.max(1))
        .collect()
        .await;

    let mut entries = Vec::new();
    for result in composed {
        match result {
            Ok(entry) => {
                let entry = apply_selections(entry, &keys);
                if let Err(e) = refresh_selections(store.as_ref(), &entry, &keys).await {
                    tracing::warn!(course_id = %entry.course_id(), error = %e, "Failed to refresh selections");
                }
                tracing::info!(
                    course_id = %entry.course_id(),
                    name = %entry.name,
                    items = entry.selection_count(),
                    bytes = entry.total_selected_size(),
                    full = entry.is_full_content_sync(),
                    "Course selected for sync"
                );
                entries.push(entry);
            }
            Err(e) => tracing::error!(course_id = %e.course_id(), error = %e, "Skipping course"),
        }
    }
    if entries.is_empty() {
        anyhow::bail!("None of the {} selected courses could be loaded", course_ids.len());
    }

    let shutdown_token = shutdown::install_signal_handler();
    let outcome = orchestrator.run(entries, shutdown_token).await?;

    let notifier = CompletionNotifier::new(progress_store, Arc::new(LogNotificationSink));
    match notify_completion(&notifier, outcome.interrupted).await {
        Ok(NotificationOutcome::Suppressed(reason)) => {
            tracing::debug!(?reason, "Notification suppressed");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to send notification"),
    }

    if outcome.interrupted {
        tracing::info!("Sync cancelled; run `course-sync sync` again to resume");
        return Ok(());
    }
    if let Some(ref error) = outcome.error {
        anyhow::bail!(
            "{} ({} of {} files failed)",
            error,
            outcome.failed_files(),
            outcome.failed_files() + outcome.downloaded_files()
        );
    }
    Ok(())
}

/// Run the status command. Read-only: no recovery sweep here, a sync may
/// be running in another process.
async fn run_status(paths: Paths, args: cli::StatusArgs) -> anyhow::Result<()> {
    if !paths.db_path.exists() {
        println!("No state database found at {}", paths.db_path.display());
        println!("Run a sync first to create the database.");
        return Ok(());
    }

    let sqlite = Arc::new(SqliteProgressStore::open(&paths.db_path).await?);
    let store: Arc<dyn ProgressStore> = sqlite.clone();
    let observer = StoreObserver::new(store.clone());

    println!("State Database: {}", paths.db_path.display());
    println!();

    let aggregate = observer
        .observe_download_progress()
        .next()
        .await
        .transpose()?
        .flatten();
    match aggregate {
        Some(agg) => {
            if agg.is_finished {
                println!("Last sync finished.");
            } else {
                println!("{}", agg.syncing_message());
            }
            println!(
                "  Progress: {:.0}% ({} of {} bytes)",
                agg.progress() * 100.0,
                agg.bytes_downloaded,
                agg.bytes_to_download
            );
            if let Some(error) = &agg.error {
                println!("  Error:    {}", error);
            }
        }
        None => println!("No sync has run yet."),
    }

    let counts = store.get_state_counts().await?;
    println!();
    println!("Items:");
    println!("  Total:       {}", counts.total());
    println!("  Downloaded:  {}", counts.downloaded);
    println!("  In progress: {}", counts.loading);
    println!("  Not started: {}", counts.not_started);
    println!("  Failed:      {}", counts.failed);

    let records = observer
        .observe_state_progress()
        .next()
        .await
        .transpose()?
        .unwrap_or_default();
    let summaries = course_summaries(&records);
    if !summaries.is_empty() {
        println!();
        println!("Courses:");
        for summary in &summaries {
            println!("  {}", summary);
        }
    }

    if args.failed && counts.failed > 0 {
        println!();
        println!("Failed items:");
        for record in records.iter().filter(|r| r.state == DownloadState::Error) {
            println!("  {} ({})", record.id, record.selection.kind());
        }
    }

    let keys = store.get_selections().await?;
    if !keys.is_empty() {
        println!();
        println!("Selections:");
        for key in keys {
            println!("  {}", key);
        }
    }

    if args.watch {
        println!();
        follow_run(sqlite).await?;
    }
    Ok(())
}

/// Print run progress on every change, including changes committed by a
/// sync in another process, until that run finishes or the user stops.
async fn follow_run(store: Arc<SqliteProgressStore>) -> anyhow::Result<()> {
    let watcher = store.watch_external_writes(Duration::from_millis(500));
    let observer = StoreObserver::new(store);
    let mut updates = observer.observe_download_progress();
    let cancel = shutdown::install_signal_handler();

    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = updates.next() => next,
        };
        let Some(item) = next else {
            break Ok(());
        };
        match item {
            Ok(Some(agg)) if agg.is_finished => {
                println!("Sync finished.");
                break Ok(());
            }
            Ok(Some(agg)) => println!(
                "{} {:.0}% ({} of {} bytes)",
                agg.syncing_message(),
                agg.progress() * 100.0,
                agg.bytes_downloaded,
                agg.bytes_to_download
            ),
            Ok(None) => println!("Waiting for a sync to start..."),
            Err(e) => break Err(e.into()),
        }
    };
    watcher.abort();
    result
}

/// Run the recover command. Refuses while a sync holds the run lock.
async fn run_recover(paths: Paths) -> anyhow::Result<()> {
    let _lock = RunLock::acquire(&paths.db_path).await?;
    let store = SqliteProgressStore::open(&paths.db_path).await?;
    let report = recovery::run_sweep(&store).await?;
    if report.is_clean() {
        println!("Nothing to recover.");
    } else {
        println!("Marked {} unfinished item(s) as failed.", report.failed_items);
        if report.run_interrupted {
            println!("Closed the interrupted sync run.");
        }
    }
    Ok(())
}

/// Run the reset-state command.
async fn run_reset_state(paths: Paths, args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let db_path = paths.db_path;

    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        return Ok(());
    }
    let _lock = RunLock::acquire(&db_path).await?;

    if !args.yes {
        println!("This will delete the state database, including all selections, at:");
        println!("  {}", db_path.display());
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    std::fs::remove_file(&db_path)?;
    println!("State database deleted.");

    let wal_path = db_path.with_extension("db-wal");
    let shm_path = db_path.with_extension("db-shm");
    let _ = std::fs::remove_file(&wal_path);
    let _ = std::fs::remove_file(&shm_path);

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.global.log_level.as_filter())),
        )
        .init();

    let paths = Paths::from_cli(&cli.global);
    match cli.command {
        Command::Select(args) => run_select(paths, args).await,
        Command::Deselect(args) => run_deselect(paths, args).await,
        Command::Sync(args) => {
            let config = Config::from_cli(&cli.global, &args)?;
            tracing::info!(
                concurrency = config.sync.file_concurrency,
                courses = config.sync.course_concurrency,
                "Starting course-sync"
            );
            run_sync(config).await
        }
        Command::Status(args) => run_status(paths, args).await,
        Command::Recover => run_recover(paths).await,
        Command::ResetState(args) => run_reset_state(paths, args).await,
    }
}
