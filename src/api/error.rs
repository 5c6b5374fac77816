use thiserror::Error;

/// Failures of the remote course API and the local content writes behind it.
///
/// `is_retryable()` drives metadata retries; `is_non_fatal()` marks
/// responses that mean "this tab is hidden for you" rather than a failure.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid JSON from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("Malformed descriptor: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            ApiError::Transport { .. } => true,
            ApiError::Json { .. } | ApiError::Disk(_) | ApiError::Malformed(_) => false,
        }
    }

    /// 401/403/404 on tab content: the tab exists but the user cannot see it.
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, ApiError::HttpStatus { status: 401 | 403 | 404, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> ApiError {
        ApiError::HttpStatus {
            status,
            url: "https://canvas.example.com/api/v1/courses/1/pages".into(),
        }
    }

    #[test]
    fn test_server_errors_retryable() {
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
    }

    #[test]
    fn test_client_errors_not_retryable() {
        for code in [400, 401, 403, 404] {
            assert!(!status(code).is_retryable(), "{code}");
        }
    }

    #[test]
    fn test_hidden_tab_statuses_are_non_fatal() {
        for code in [401, 403, 404] {
            assert!(status(code).is_non_fatal(), "{code}");
        }
        assert!(!status(500).is_non_fatal());
        assert!(!ApiError::Malformed("x".into()).is_non_fatal());
    }

    #[test]
    fn test_disk_not_retryable() {
        let e = ApiError::Disk(std::io::Error::other("disk full"));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_connection_error_retryable() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(reqwest::Client::new().get("http://127.0.0.1:1").send())
            .unwrap_err();
        let e = ApiError::Transport {
            source: err,
            url: "http://127.0.0.1:1".into(),
        };
        assert!(e.is_retryable());
        assert!(!e.is_non_fatal());
    }
}
