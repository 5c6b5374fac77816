use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "course-sync",
    about = "Sync course content for offline use",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Path of the progress and selection database
    #[arg(long, global = true, default_value = "~/.course-sync/state.db")]
    pub db_path: String,

    /// Root directory for offline content
    #[arg(long, global = true, default_value = "~/.course-sync/offline")]
    pub content_dir: String,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

/// Credentials for the course API.
#[derive(Args, Debug, Clone)]
pub struct ApiArgs {
    /// Base URL of the Canvas instance, e.g. https://school.instructure.com
    #[arg(long, env = "CANVAS_BASE_URL")]
    pub base_url: Option<String>,

    /// API access token.
    /// WARNING: passing via --token is visible in process listings.
    /// Prefer the CANVAS_TOKEN environment variable instead.
    #[arg(long, env = "CANVAS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Select a course, or some of its tabs and files, for offline use
    Select(SelectArgs),
    /// Drop a course's selection and its local content
    Deselect(DeselectArgs),
    /// Download everything selected
    Sync(SyncArgs),
    /// Show progress of the last sync
    Status(StatusArgs),
    /// Fail items left in progress by an interrupted sync
    Recover,
    /// Delete the state database
    ResetState(ResetStateArgs),
}

#[derive(Args, Debug)]
pub struct SelectArgs {
    /// Course id
    pub course: String,

    /// Tab to select (e.g. pages, files); repeatable
    #[arg(long = "tab")]
    pub tabs: Vec<String>,

    /// File id to select; repeatable
    #[arg(long = "file")]
    pub files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DeselectArgs {
    /// Course id
    pub course: String,

    #[command(flatten)]
    pub api: ApiArgs,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub api: ApiArgs,

    /// Allow cached file listings
    #[arg(long)]
    pub use_cache: bool,

    /// Number of concurrent file downloads per course
    #[arg(long, default_value_t = 6)]
    pub concurrency: usize,

    /// Number of courses synced at once
    #[arg(long, default_value_t = 3)]
    pub course_concurrency: usize,

    /// Minimum milliseconds between progress writes per file
    #[arg(long, default_value_t = 300)]
    pub progress_interval_ms: u64,

    /// Max retries for metadata requests (0 = no retries)
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 2)]
    pub retry_delay: u64,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// List failed items
    #[arg(long)]
    pub failed: bool,

    /// Keep printing run progress until the running sync finishes
    #[arg(long)]
    pub watch: bool,
}

#[derive(Args, Debug)]
pub struct ResetStateArgs {
    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_defaults() {
        let cli = Cli::try_parse_from(["course-sync", "sync"]).unwrap();
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.concurrency, 6);
        assert_eq!(args.course_concurrency, 3);
        assert_eq!(args.progress_interval_ms, 300);
        assert!(!args.use_cache);
        assert_eq!(cli.global.db_path, "~/.course-sync/state.db");
        assert_eq!(cli.global.log_level, LogLevel::Info);
    }

    #[test]
    fn test_select_with_tabs_and_files() {
        let cli = Cli::try_parse_from([
            "course-sync",
            "select",
            "42",
            "--tab",
            "pages",
            "--tab",
            "modules",
            "--file",
            "7",
        ])
        .unwrap();
        let Command::Select(args) = cli.command else {
            panic!("expected select");
        };
        assert_eq!(args.course, "42");
        assert_eq!(args.tabs, vec!["pages", "modules"]);
        assert_eq!(args.files, vec!["7"]);
    }

    #[test]
    fn test_global_args_after_subcommand() {
        let cli = Cli::try_parse_from([
            "course-sync",
            "status",
            "--failed",
            "--db-path",
            "/tmp/x.db",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.global.db_path, "/tmp/x.db");
        assert_eq!(cli.global.log_level, LogLevel::Debug);
        assert!(matches!(
            cli.command,
            Command::Status(StatusArgs {
                failed: true,
                watch: false
            })
        ));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["course-sync"]).is_err());
    }
}
