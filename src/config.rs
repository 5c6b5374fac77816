use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{ApiArgs, GlobalArgs, SyncArgs};
use crate::download::SyncConfig;
use crate::retry::RetryConfig;

/// Paths shared by every command.
#[derive(Debug, Clone)]
pub struct Paths {
    pub db_path: PathBuf,
    pub content_dir: PathBuf,
}

impl Paths {
    pub fn from_cli(global: &GlobalArgs) -> Self {
        Self {
            db_path: expand_tilde(&global.db_path),
            content_dir: expand_tilde(&global.content_dir),
        }
    }
}

/// Resolved API credentials.
pub struct ApiConfig {
    pub base_url: String,
    pub token: String,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl ApiConfig {
    pub fn from_cli(args: &ApiArgs) -> anyhow::Result<Self> {
        let base_url = args
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("--base-url (or CANVAS_BASE_URL) is required"))?;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            anyhow::bail!("--base-url must start with http:// or https://, got '{}'", base_url);
        }
        let token = args
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("--token (or CANVAS_TOKEN) is required"))?;
        Ok(Self {
            base_url: base_url.to_string(),
            token,
        })
    }
}

/// Configuration of the `sync` command.
#[derive(Debug)]
pub struct Config {
    pub paths: Paths,
    pub api: ApiConfig,
    pub retry: RetryConfig,
    pub sync: SyncConfig,
    pub use_cache: bool,
}

impl Config {
    pub fn from_cli(global: &GlobalArgs, args: &SyncArgs) -> anyhow::Result<Self> {
        if args.concurrency == 0 || args.course_concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }

        Ok(Self {
            paths: Paths::from_cli(global),
            api: ApiConfig::from_cli(&args.api)?,
            retry: RetryConfig {
                max_retries: args.max_retries,
                base_delay: Duration::from_secs(args.retry_delay),
                ..RetryConfig::default()
            },
            sync: SyncConfig {
                course_concurrency: args.course_concurrency,
                file_concurrency: args.concurrency,
                progress_interval: Duration::from_millis(args.progress_interval_ms),
                no_progress_bar: args.no_progress_bar,
            },
            use_cache: args.use_cache,
        })
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
