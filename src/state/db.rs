//! Progress store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::error::StateError;
use super::schema;
use super::types::{
    records_for_selected, AggregateProgressRecord, ItemSelection, StateCounts,
    StateProgressRecord,
};
use crate::model::{course_id_of_key, DownloadState, SyncEntry};

/// Durable per-item state, the run aggregate and persisted selections.
///
/// Object-safe so it can be shared as `Arc<dyn ProgressStore>` between the
/// progress writer, observers and the notifier.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Upsert one item record by `id`.
    async fn save_state_progress(
        &self,
        id: &str,
        selection: &ItemSelection,
        state: DownloadState,
    ) -> Result<(), StateError>;

    /// Upsert many item records in one transaction.
    async fn save_state_progress_batch(
        &self,
        records: &[StateProgressRecord],
    ) -> Result<(), StateError>;

    /// Rewrite every `loading` record to `error`. Returns the number changed.
    async fn mark_in_progress_downloads_as_failed(&self) -> Result<u64, StateError>;

    /// Recompute the aggregate from `entries`, union-ing `course_ids` with
    /// the persisted set. `is_finished` is preserved.
    async fn save_download_progress(
        &self,
        entries: &[SyncEntry],
    ) -> Result<AggregateProgressRecord, StateError>;

    /// Record the end of a run.
    async fn save_download_result(
        &self,
        is_finished: bool,
        error: Option<&str>,
    ) -> Result<(), StateError>;

    /// Drop the aggregate and every item record of the previous run.
    async fn clean_up_previous_download_progress(&self) -> Result<(), StateError>;

    /// Write every selected course, tab and file as `loading(nil)`.
    async fn set_initial_loading_state(&self, entries: &[SyncEntry]) -> Result<(), StateError>;

    async fn get_state_progress(&self) -> Result<Vec<StateProgressRecord>, StateError>;

    async fn get_download_progress(&self) -> Result<Option<AggregateProgressRecord>, StateError>;

    async fn get_state_counts(&self) -> Result<StateCounts, StateError>;

    /// Persist selection keys. Existing keys are kept.
    async fn save_selections(&self, keys: &[String]) -> Result<(), StateError>;

    async fn get_selections(&self) -> Result<Vec<String>, StateError>;

    /// Remove every key of one course. Returns the number removed.
    async fn remove_course_selections(&self, course_id: &str) -> Result<u64, StateError>;

    /// Change counter, bumped after every committed write through this
    /// handle. Writes by other processes only show up while
    /// [`SqliteProgressStore::watch_external_writes`] runs.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// SQLite implementation of [`ProgressStore`].
pub struct SqliteProgressStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    changes: watch::Sender<u64>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteProgressStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteProgressStore {
    /// Open or create a store at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                // Connection::open reports the missing directory as a generic error.
                let _ = std::fs::create_dir_all(parent);
            }
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL lets observers read while the writer commits.
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self::from_connection(conn, path))
    }

    /// Open an in-memory store (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self::from_connection(conn, PathBuf::from(":memory:")))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            conn: Mutex::new(conn),
            changes,
            path,
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// `PRAGMA data_version` moves only when another connection commits.
    fn data_version(&self) -> Result<i64, StateError> {
        let conn = self.lock()?;
        conn.query_row("PRAGMA data_version", [], |row| row.get(0))
            .map_err(StateError::query)
    }

    /// Poll for commits made by other connections, usually a sync running
    /// in another process, and bump the change counter for them. Stops
    /// once the store is dropped or the database becomes unreadable.
    pub fn watch_external_writes(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = None;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                match store.data_version() {
                    Ok(version) => {
                        if last.is_some_and(|seen| seen != version) {
                            store.notify_changed();
                        }
                        last = Some(version);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Stopped watching for external writes");
                        break;
                    }
                }
            }
        })
    }
}

/// Run `f` inside BEGIN/COMMIT, rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, StateError>,
) -> Result<T, StateError> {
    conn.execute("BEGIN TRANSACTION", [])
        .map_err(StateError::query)?;

    match f(conn) {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(StateError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

fn upsert_state(
    conn: &Connection,
    id: &str,
    selection: &ItemSelection,
    state: DownloadState,
    updated_at: i64,
) -> Result<(), StateError> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            INSERT INTO state_progress (id, selection_kind, course_id, item_id, state, progress, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                selection_kind = excluded.selection_kind,
                course_id = excluded.course_id,
                item_id = excluded.item_id,
                state = excluded.state,
                progress = excluded.progress,
                updated_at = excluded.updated_at
            "#,
        )
        .map_err(StateError::query)?;

    stmt.execute(rusqlite::params![
        id,
        selection.kind(),
        selection.course_id(),
        selection.item_id(),
        state.as_str(),
        state.progress(),
        updated_at,
    ])
    .map_err(StateError::query)?;
    Ok(())
}

fn read_aggregate(conn: &Connection) -> Result<Option<AggregateProgressRecord>, StateError> {
    let row: Option<(i64, i64, bool, Option<String>, String)> = conn
        .query_row(
            "SELECT bytes_to_download, bytes_downloaded, is_finished, error, course_ids FROM download_progress WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()
        .map_err(StateError::query)?;

    let Some((to_download, downloaded, is_finished, error, course_ids)) = row else {
        return Ok(None);
    };
    let course_ids: Vec<String> =
        serde_json::from_str(&course_ids).map_err(|e| StateError::Corrupt {
            id: "download_progress".to_string(),
            reason: e.to_string(),
        })?;

    Ok(Some(AggregateProgressRecord {
        bytes_to_download: to_download.max(0) as u64,
        bytes_downloaded: downloaded.max(0) as u64,
        is_finished,
        error,
        course_ids,
    }))
}

fn write_aggregate(conn: &Connection, record: &AggregateProgressRecord) -> Result<(), StateError> {
    let course_ids = serde_json::to_string(&record.course_ids).map_err(|e| StateError::Corrupt {
        id: "download_progress".to_string(),
        reason: e.to_string(),
    })?;

    conn.execute(
        r#"
        INSERT INTO download_progress (id, bytes_to_download, bytes_downloaded, is_finished, error, course_ids, updated_at)
        VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
            bytes_to_download = excluded.bytes_to_download,
            bytes_downloaded = excluded.bytes_downloaded,
            is_finished = excluded.is_finished,
            error = excluded.error,
            course_ids = excluded.course_ids,
            updated_at = excluded.updated_at
        "#,
        rusqlite::params![
            record.bytes_to_download as i64,
            record.bytes_downloaded as i64,
            record.is_finished,
            record.error,
            course_ids,
            Utc::now().timestamp(),
        ],
    )
    .map_err(StateError::query)?;
    Ok(())
}

type StateRow = (String, String, String, Option<String>, String, Option<f64>);

fn row_to_state_record(row: StateRow) -> Result<StateProgressRecord, StateError> {
    let (id, kind, course_id, item_id, state, progress) = row;
    let selection =
        ItemSelection::from_parts(&kind, course_id, item_id).ok_or_else(|| StateError::Corrupt {
            id: id.clone(),
            reason: format!("unknown selection kind '{kind}'"),
        })?;
    let state = DownloadState::from_parts(&state, progress).ok_or_else(|| StateError::Corrupt {
        id: id.clone(),
        reason: format!("unknown state '{state}'"),
    })?;
    Ok(StateProgressRecord {
        id,
        selection,
        state,
    })
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn save_state_progress(
        &self,
        id: &str,
        selection: &ItemSelection,
        state: DownloadState,
    ) -> Result<(), StateError> {
        {
            let conn = self.lock()?;
            upsert_state(&conn, id, selection, state, Utc::now().timestamp())?;
        }
        self.notify_changed();
        Ok(())
    }

    async fn save_state_progress_batch(
        &self,
        records: &[StateProgressRecord],
    ) -> Result<(), StateError> {
        if records.is_empty() {
            return Ok(());
        }

        {
            let conn = self.lock()?;
            let now = Utc::now().timestamp();
            in_transaction(&conn, |conn| {
                for record in records {
                    upsert_state(conn, &record.id, &record.selection, record.state, now)?;
                }
                Ok(())
            })?;
        }
        self.notify_changed();
        Ok(())
    }

    async fn mark_in_progress_downloads_as_failed(&self) -> Result<u64, StateError> {
        let rows = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE state_progress SET state = 'error', progress = NULL, updated_at = ?1 WHERE state = 'loading'",
                [Utc::now().timestamp()],
            )
            .map_err(StateError::query)?
        };

        if rows > 0 {
            self.notify_changed();
        }
        Ok(rows as u64)
    }

    async fn save_download_progress(
        &self,
        entries: &[SyncEntry],
    ) -> Result<AggregateProgressRecord, StateError> {
        let mut next = AggregateProgressRecord::from_entries(entries);
        let incoming = std::mem::take(&mut next.course_ids);

        {
            let conn = self.lock()?;
            if let Some(previous) = read_aggregate(&conn)? {
                next.course_ids = previous.course_ids;
                next.is_finished = previous.is_finished;
            }
            next.union_course_ids(&incoming);
            write_aggregate(&conn, &next)?;
        }

        self.notify_changed();
        Ok(next)
    }

    async fn save_download_result(
        &self,
        is_finished: bool,
        error: Option<&str>,
    ) -> Result<(), StateError> {
        {
            let conn = self.lock()?;
            let mut record = read_aggregate(&conn)?.unwrap_or_default();
            record.is_finished = is_finished;
            record.error = error.map(str::to_string);
            write_aggregate(&conn, &record)?;
        }
        self.notify_changed();
        Ok(())
    }

    async fn clean_up_previous_download_progress(&self) -> Result<(), StateError> {
        {
            let conn = self.lock()?;
            in_transaction(&conn, |conn| {
                conn.execute("DELETE FROM state_progress", [])
                    .map_err(StateError::query)?;
                conn.execute("DELETE FROM download_progress", [])
                    .map_err(StateError::query)?;
                Ok(())
            })?;
        }
        self.notify_changed();
        Ok(())
    }

    async fn set_initial_loading_state(&self, entries: &[SyncEntry]) -> Result<(), StateError> {
        let records: Vec<StateProgressRecord> = entries
            .iter()
            .flat_map(|e| records_for_selected(e, DownloadState::Loading(None)))
            .collect();
        tracing::debug!(count = records.len(), "Seeding loading state");
        self.save_state_progress_batch(&records).await
    }

    async fn get_state_progress(&self) -> Result<Vec<StateProgressRecord>, StateError> {
        let rows: Vec<StateRow> = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id, selection_kind, course_id, item_id, state, progress FROM state_progress ORDER BY id",
                )
                .map_err(StateError::query)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?;
            rows
        };

        rows.into_iter().map(row_to_state_record).collect()
    }

    async fn get_download_progress(&self) -> Result<Option<AggregateProgressRecord>, StateError> {
        let conn = self.lock()?;
        read_aggregate(&conn)
    }

    async fn get_state_counts(&self) -> Result<StateCounts, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT state, COUNT(*) FROM state_progress GROUP BY state")
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        let mut counts = StateCounts::default();
        for (state, count) in rows {
            let count = count.max(0) as u64;
            match DownloadState::from_parts(&state, None) {
                Some(DownloadState::NotStarted) => counts.not_started += count,
                Some(DownloadState::Loading(_)) => counts.loading += count,
                Some(DownloadState::Downloaded) => counts.downloaded += count,
                Some(DownloadState::Error) => counts.failed += count,
                None => tracing::warn!(state = %state, count, "Ignoring unknown state"),
            }
        }
        Ok(counts)
    }

    async fn save_selections(&self, keys: &[String]) -> Result<(), StateError> {
        if keys.is_empty() {
            return Ok(());
        }

        {
            let conn = self.lock()?;
            let now = Utc::now().timestamp();
            in_transaction(&conn, |conn| {
                let mut stmt = conn
                    .prepare_cached(
                        "INSERT OR IGNORE INTO sync_selections (key, course_id, created_at) VALUES (?1, ?2, ?3)",
                    )
                    .map_err(StateError::query)?;
                for key in keys {
                    let course_id =
                        course_id_of_key(key).ok_or_else(|| StateError::InvalidKey(key.clone()))?;
                    stmt.execute(rusqlite::params![key, course_id, now])
                        .map_err(StateError::query)?;
                }
                Ok(())
            })?;
        }
        self.notify_changed();
        Ok(())
    }

    async fn get_selections(&self) -> Result<Vec<String>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT key FROM sync_selections ORDER BY created_at, key")
            .map_err(StateError::query)?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(keys)
    }

    async fn remove_course_selections(&self, course_id: &str) -> Result<u64, StateError> {
        let rows = {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM sync_selections WHERE course_id = ?1",
                [course_id],
            )
            .map_err(StateError::query)?
        };
        if rows > 0 {
            self.notify_changed();
        }
        Ok(rows as u64)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
