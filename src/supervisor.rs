use crate::action::{ActionOutput, BuildAction, BuildContext};
use crate::config::{DEFAULT_TIMEOUT, EffectiveConfig};
use crate::error::BuildError;
use crate::results;
use anyhow::anyhow;
use chrono::{SecondsFormat, Utc};
use dispatch_core::model::{BuildReport, BuildStatus, ExecuteResult, HookEvent};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bytes of action output kept in `result.json`.
pub const OUTPUT_SUMMARY_LIMIT: usize = 4_000;

const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Records `event`, then runs `action` under the configured deadline.
///
/// `hook.json` is written before the action starts; if that fails the action
/// never runs. On timeout the action's task is aborted, its workspace is
/// removed, and the caller gets [`BuildError::Timeout`] without waiting for
/// the action to finish.
pub async fn on_hook_build(
    git_ref: &str,
    config: &EffectiveConfig,
    event: &HookEvent,
    status_context: &str,
    action: Arc<dyn BuildAction>,
) -> Result<ExecuteResult, BuildError> {
    let result_path = results::create_result_dir(&config.result_root, &event.owner, &event.repo)
        .await
        .map_err(BuildError::Persistence)?;
    results::record_hook(&result_path, event)
        .await
        .map_err(BuildError::Persistence)?;

    let deadline = effective_timeout(config.timeout);
    let started_at = timestamp();
    info!(
        owner = %event.owner,
        repo = %event.repo,
        git_ref,
        result_path = %result_path.display(),
        timeout_secs = deadline.as_secs(),
        "build started"
    );

    let context = BuildContext {
        git_ref: git_ref.to_string(),
        result_path: result_path.clone(),
        config: config.clone(),
        event: event.clone(),
        status_context: status_context.to_string(),
    };

    let workspace = context.workspace_dir();
    let mut task = tokio::spawn(action.execute(context));
    let (outcome, failure_output) = match tokio::time::timeout(deadline, &mut task).await {
        Ok(Ok(Ok(output))) => (Ok(output), String::new()),
        Ok(Ok(Err(failure))) => (
            Err(BuildError::Action {
                error: failure.error,
                exit_code: failure.exit_code,
                log_path: failure.log_path,
            }),
            failure.output,
        ),
        Ok(Err(join_error)) => (
            Err(BuildError::Action {
                error: anyhow!("build action did not complete: {join_error}"),
                exit_code: None,
                log_path: None,
            }),
            String::new(),
        ),
        Err(_elapsed) => {
            task.abort();
            // Children must be killed before their workspace goes.
            if tokio::time::timeout(ABORT_GRACE, task).await.is_err() {
                warn!(
                    owner = %event.owner,
                    repo = %event.repo,
                    git_ref,
                    "timed out build did not stop within grace period"
                );
            }
            remove_workspace(&workspace).await;
            (Err(BuildError::Timeout(deadline)), String::new())
        }
    };

    let report = build_report(&outcome, &failure_output, started_at, timestamp());
    if let Err(record_error) = results::record_report(&result_path, &report).await {
        warn!(
            result_path = %result_path.display(),
            error = %record_error,
            "failed to record build report"
        );
    }

    match &outcome {
        Ok(output) => info!(
            owner = %event.owner,
            repo = %event.repo,
            git_ref,
            exit_code = output.result.exit_code,
            status = report.status.as_str(),
            "build finished"
        ),
        Err(build_error) => error!(
            owner = %event.owner,
            repo = %event.repo,
            git_ref,
            kind = build_error.kind(),
            error = %build_error,
            "build failed"
        ),
    }

    outcome.map(|output| output.result)
}

pub fn effective_timeout(configured: Duration) -> Duration {
    if configured.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        configured
    }
}

fn build_report(
    outcome: &Result<ActionOutput, BuildError>,
    failure_output: &str,
    started_at: String,
    finished_at: String,
) -> BuildReport {
    match outcome {
        Ok(output) => BuildReport {
            status: if output.result.success() {
                BuildStatus::Succeeded
            } else {
                BuildStatus::Failed
            },
            exit_code: Some(output.result.exit_code),
            log_path: output.result.log_path.clone(),
            output: summarize_output(&output.output, OUTPUT_SUMMARY_LIMIT),
            error: None,
            started_at,
            finished_at,
        },
        Err(build_error) => BuildReport {
            status: match build_error {
                BuildError::Timeout(_) => BuildStatus::TimedOut,
                _ => BuildStatus::Errored,
            },
            exit_code: match build_error {
                BuildError::Action { exit_code, .. } => *exit_code,
                _ => None,
            },
            log_path: match build_error {
                BuildError::Action { log_path, .. } => log_path.clone(),
                _ => None,
            },
            output: summarize_output(failure_output, OUTPUT_SUMMARY_LIMIT),
            error: Some(build_error.to_string()),
            started_at,
            finished_at,
        },
    }
}

/// Keeps the tail of `output`, where build failures usually show up.
fn summarize_output(output: &str, limit_bytes: usize) -> String {
    if output.len() <= limit_bytes {
        return output.to_string();
    }

    let budget = limit_bytes.saturating_sub(3);
    let mut start = output.len() - budget;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &output[start..])
}

async fn remove_workspace(workspace: &Path) {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!(
            workspace = %workspace.display(),
            error = %error,
            "failed to remove workspace of timed out build"
        ),
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
