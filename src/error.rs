use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a single build did not produce a result. None of these are fatal to the
/// dispatcher process.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Configuration was missing, malformed or invalid; nothing was recorded.
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),
    /// The result directory or its metadata could not be written; the action
    /// was not started.
    #[error("persistence error: {0:#}")]
    Persistence(anyhow::Error),
    /// The action outlived its deadline. `hook.json` is on disk.
    #[error("build did not finish within {}s", .0.as_secs())]
    Timeout(Duration),
    /// The action itself failed. `hook.json` is on disk, and `result.json`
    /// carries whatever exit code and log the action got to produce.
    #[error("build action failed: {error:#}")]
    Action {
        error: anyhow::Error,
        exit_code: Option<i32>,
        log_path: Option<PathBuf>,
    },
}

impl BuildError {
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::Config(_) => "config",
            BuildError::Persistence(_) => "persistence",
            BuildError::Timeout(_) => "timeout",
            BuildError::Action { .. } => "action",
        }
    }
}
