//! Crash recovery sweep.
//!
//! Once a process holds the [`RunLock`](crate::state::RunLock) no other
//! orchestrator can be alive, so every `loading` record is abandoned: each
//! is failed and an unfinished aggregate is closed out. The user retries
//! by syncing again.

use crate::state::{ProgressStore, StateError};

pub const INTERRUPTED_ERROR: &str = "Offline sync was interrupted before it could finish.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Item records moved from `loading` to `error`.
    pub failed_items: u64,
    /// Whether an unfinished run aggregate was found and closed.
    pub run_interrupted: bool,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed_items == 0 && !self.run_interrupted
    }
}

/// Run the sweep. Must happen before any new sync starts, under the run
/// lock. Idempotent.
pub async fn run_sweep(store: &dyn ProgressStore) -> Result<RecoveryReport, StateError> {
    let failed_items = store.mark_in_progress_downloads_as_failed().await?;

    let run_interrupted = match store.get_download_progress().await? {
        Some(aggregate) if !aggregate.is_finished => {
            store
                .save_download_result(true, Some(INTERRUPTED_ERROR))
                .await?;
            true
        }
        _ => false,
    };

    let report = RecoveryReport {
        failed_items,
        run_interrupted,
    };
    if report.is_clean() {
        tracing::debug!("Recovery sweep found nothing to repair");
    } else {
        tracing::warn!(
            failed_items = report.failed_items,
            run_interrupted = report.run_interrupted,
            "Recovered from an interrupted sync"
        );
    }
    Ok(report)
}
