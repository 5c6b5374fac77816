use thiserror::Error;

use crate::api::ApiError;
use crate::state::StateError;

/// Errors of a sync run.
///
/// `Transport` is per file: it marks that file failed and never aborts
/// sibling downloads. `Store` and `Writer` abort the run.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Transfer of file {file_id} failed: {source}")]
    Transport {
        file_id: String,
        #[source]
        source: ApiError,
    },

    #[error("Progress store failed: {0}")]
    Store(#[from] StateError),

    #[error("Progress writer stopped unexpectedly: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_names_file() {
        let e = DownloadError::Transport {
            file_id: "42".into(),
            source: ApiError::HttpStatus {
                status: 502,
                url: "https://canvas.example.com/files/42".into(),
            },
        };
        let msg = e.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("502"));
    }

    #[test]
    fn test_store_error_converts() {
        let e: DownloadError = StateError::Query("locked".into()).into();
        assert!(matches!(e, DownloadError::Store(_)));
    }
}
