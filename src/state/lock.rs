//! Exclusive run lock next to the state database.
//!
//! Only one process may repair or drive sync state at a time. Commands
//! that merely read or edit selections never take it.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use super::error::StateError;

/// Held for as long as the value lives; the OS drops the lock with the
/// file handle, also when the process dies.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    _file: File,
}

impl RunLock {
    fn path_for(db_path: &Path) -> PathBuf {
        db_path.with_extension("lock")
    }

    /// Take the lock for the database at `db_path` without waiting.
    pub async fn acquire(db_path: &Path) -> Result<Self, StateError> {
        let path = Self::path_for(db_path);
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| StateError::LockFile {
                    path: path.clone(),
                    source,
                })?;
            }
            let file = File::create(&path).map_err(|source| StateError::LockFile {
                path: path.clone(),
                source,
            })?;
            file.try_lock_exclusive()
                .map_err(|_| StateError::Busy { path: path.clone() })?;
            Ok::<Self, StateError>(Self { path, _file: file })
        })
        .await?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("course_sync")
            .join("run_lock_tests")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("state.db")
    }

    #[tokio::test]
    async fn test_second_holder_is_refused() {
        let db = db_path("exclusive");
        let held = RunLock::acquire(&db).await.unwrap();
        assert_eq!(held.path(), db.with_extension("lock"));

        let err = RunLock::acquire(&db).await.unwrap_err();
        assert!(matches!(err, StateError::Busy { .. }));
        assert!(err.to_string().contains("state.lock"));

        drop(held);
        assert!(RunLock::acquire(&db).await.is_ok());
    }
}
