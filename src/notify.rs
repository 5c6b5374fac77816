//! Completion notifier: one decision pass after a run settles.
//!
//! The notifier only reads the durable stores, so it can run after the
//! orchestrator is gone. Whether a progress screen is visible is passed in
//! by the caller.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::state::{ProgressStore, StateError};

pub const FAILURE_TITLE: &str = "Offline Content Sync Failed";
pub const FAILURE_BODY: &str =
    "One or more items failed to sync. Please check your internet connection and retry syncing.";
pub const SUCCESS_TITLE: &str = "Offline Content Sync Success";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to read sync progress: {0}")]
    Store(#[from] StateError),

    #[error("Failed to deliver notification: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn failure() -> Self {
        Self {
            title: FAILURE_TITLE.to_string(),
            body: FAILURE_BODY.to_string(),
        }
    }

    pub fn success(items: u64) -> Self {
        Self {
            title: SUCCESS_TITLE.to_string(),
            body: format!("{items} items are now available offline."),
        }
    }
}

/// Displays a notification. Delivery mechanics are the sink's business.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sink that writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(title = %notification.title, "{}", notification.body);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    ProgressScreenActive,
    NothingToReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Suppressed(SuppressReason),
    Failed,
    Succeeded { items: u64 },
}

pub struct CompletionNotifier {
    store: Arc<dyn ProgressStore>,
    sink: Arc<dyn NotificationSink>,
}

impl CompletionNotifier {
    pub fn new(store: Arc<dyn ProgressStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, sink }
    }

    /// Decide and deliver the notification for the finished run.
    ///
    /// A visible progress screen suppresses everything. Otherwise a failed
    /// run reports failure, and a successful one reports the number of
    /// downloaded items when there is at least one.
    pub async fn send(
        &self,
        is_progress_screen_active: bool,
    ) -> Result<NotificationOutcome, NotifyError> {
        if is_progress_screen_active {
            return Ok(NotificationOutcome::Suppressed(
                SuppressReason::ProgressScreenActive,
            ));
        }

        let failed = self
            .store
            .get_download_progress()
            .await?
            .is_some_and(|a| a.is_sync_failed());
        if failed {
            return self.send_failed_notification().await;
        }

        let items = self.store.get_state_counts().await?.downloaded;
        if items == 0 {
            tracing::debug!("No downloaded items, skipping notification");
            return Ok(NotificationOutcome::Suppressed(
                SuppressReason::NothingToReport,
            ));
        }

        self.sink.deliver(&Notification::success(items)).await?;
        Ok(NotificationOutcome::Succeeded { items })
    }

    /// Report failure unconditionally, e.g. after an interrupted run.
    pub async fn send_failed_notification(&self) -> Result<NotificationOutcome, NotifyError> {
        self.sink.deliver(&Notification::failure()).await?;
        Ok(NotificationOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DownloadState;
    use crate::state::{ItemSelection, SqliteProgressStore, StateProgressRecord, FILE_DOWNLOAD_FAILED};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        fn delivered(&self) -> Vec<Notification> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.delivered.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    async fn setup(downloaded: usize) -> (CompletionNotifier, Arc<SqliteProgressStore>, Arc<RecordingSink>) {
        let store = Arc::new(SqliteProgressStore::open_in_memory().unwrap());
        let records: Vec<StateProgressRecord> = (0..downloaded)
            .map(|i| {
                StateProgressRecord::new(
                    format!("courses/1/files/{i}"),
                    ItemSelection::File {
                        course_id: "1".into(),
                        file_id: i.to_string(),
                    },
                    DownloadState::Downloaded,
                )
            })
            .collect();
        store.save_state_progress_batch(&records).await.unwrap();
        store.save_download_result(true, None).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let notifier = CompletionNotifier::new(store.clone(), sink.clone());
        (notifier, store, sink)
    }

    #[tokio::test]
    async fn test_nothing_downloaded_is_suppressed() {
        let (notifier, _, sink) = setup(0).await;
        let outcome = notifier.send(false).await.unwrap();
        assert_eq!(
            outcome,
            NotificationOutcome::Suppressed(SuppressReason::NothingToReport)
        );
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_success_body_starts_with_count() {
        let (notifier, _, sink) = setup(13).await;
        let outcome = notifier.send(false).await.unwrap();
        assert_eq!(outcome, NotificationOutcome::Succeeded { items: 13 });

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].title, SUCCESS_TITLE);
        assert!(delivered[0].body.starts_with("13"));
        assert_eq!(delivered[0].body, "13 items are now available offline.");
    }

    #[tokio::test]
    async fn test_active_progress_screen_suppresses() {
        let (notifier, store, sink) = setup(13).await;
        store
            .save_download_result(true, Some(FILE_DOWNLOAD_FAILED))
            .await
            .unwrap();
        let outcome = notifier.send(true).await.unwrap();
        assert_eq!(
            outcome,
            NotificationOutcome::Suppressed(SuppressReason::ProgressScreenActive)
        );
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_reports_failure() {
        let (notifier, store, sink) = setup(3).await;
        store
            .save_download_result(true, Some(FILE_DOWNLOAD_FAILED))
            .await
            .unwrap();
        assert_eq!(notifier.send(false).await.unwrap(), NotificationOutcome::Failed);
        assert_eq!(sink.delivered(), vec![Notification::failure()]);
    }

    #[tokio::test]
    async fn test_send_failed_notification_is_unconditional() {
        let (notifier, _, sink) = setup(0).await;
        assert_eq!(
            notifier.send_failed_notification().await.unwrap(),
            NotificationOutcome::Failed
        );
        assert_eq!(sink.delivered()[0].title, FAILURE_TITLE);
    }
}
