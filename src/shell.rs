use crate::action::{ActionFailure, ActionOutput, BuildAction, BuildContext};
use anyhow::{Context, Result, anyhow};
use dispatch_core::model::ExecuteResult;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const BUILD_LOG_FILE_NAME: &str = "build.log";

/// Bytes from the end of `build.log` handed back as action output.
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// Clones the repository, checks out the requested ref and runs the
/// repository's build script with `sh`.
///
/// All child processes are spawned with `kill_on_drop`, so aborting the build
/// task on timeout also kills whatever step is running. A failing step still
/// hands back its exit code and the tail of `build.log`.
#[derive(Debug, Clone, Default)]
pub struct ShellBuildAction;

impl BuildAction for ShellBuildAction {
    fn execute(
        &self,
        context: BuildContext,
    ) -> BoxFuture<'static, Result<ActionOutput, ActionFailure>> {
        clone_and_build(context).boxed()
    }
}

#[derive(Debug, Error)]
#[error("{step} exited with {status}")]
struct StepExit {
    step: &'static str,
    status: ExitStatus,
}

async fn clone_and_build(context: BuildContext) -> Result<ActionOutput, ActionFailure> {
    let workspace = context.workspace_dir();
    let clone_dir = context.clone_dir()?;
    let log_path = context.result_path.join(BUILD_LOG_FILE_NAME);

    tokio::fs::create_dir_all(&workspace)
        .await
        .with_context(|| format!("create workspace {}", workspace.display()))?;

    let outcome = run_steps(&context, &workspace, &clone_dir, &log_path).await;

    if let Err(error) = tokio::fs::remove_dir_all(&workspace).await {
        warn!(
            workspace = %workspace.display(),
            error = %error,
            "failed to remove build workspace"
        );
    }

    let output = read_tail(&log_path, OUTPUT_TAIL_BYTES).await;
    match outcome {
        Ok(exit_code) => Ok(ActionOutput {
            result: ExecuteResult {
                exit_code,
                log_path: Some(log_path),
            },
            output,
        }),
        Err(error) => {
            let exit_code = error
                .downcast_ref::<StepExit>()
                .and_then(|step| step.status.code());
            let failure = ActionFailure::from(error).with_exit_code(exit_code);
            if tokio::fs::try_exists(&log_path).await.unwrap_or(false) {
                Err(failure.with_log(log_path, output))
            } else {
                Err(failure)
            }
        }
    }
}

async fn run_steps(
    context: &BuildContext,
    workspace: &Path,
    clone_dir: &Path,
    log_path: &Path,
) -> Result<i32> {
    let url = clone_url(
        &context.config.clone_source,
        &context.event.owner,
        &context.event.repo,
    );
    let clone_target = clone_dir.to_string_lossy().into_owned();
    let envs = build_env(context, workspace);

    debug!(url = %url, clone_dir = %clone_dir.display(), "cloning repository");
    let status = run_step(
        "git",
        &["clone", "--quiet", url.as_str(), clone_target.as_str()],
        workspace,
        &envs,
        log_path,
    )
    .await?;
    ensure_success("git clone", status)?;

    if !context.git_ref.is_empty() {
        let status = run_step(
            "git",
            &["fetch", "--quiet", "origin", context.git_ref.as_str()],
            clone_dir,
            &envs,
            log_path,
        )
        .await?;
        ensure_success("git fetch", status)?;

        let status = run_step(
            "git",
            &["checkout", "--quiet", "FETCH_HEAD"],
            clone_dir,
            &envs,
            log_path,
        )
        .await?;
        ensure_success("git checkout", status)?;
    }

    let script = clone_dir.join(&context.config.build_script);
    if !script.is_file() {
        return Err(anyhow!("build script {} not found", script.display()));
    }

    info!(
        owner = %context.event.owner,
        repo = %context.event.repo,
        script = %context.config.build_script,
        "running build script"
    );
    let status = run_step(
        "sh",
        &[context.config.build_script.as_str()],
        clone_dir,
        &envs,
        log_path,
    )
    .await?;

    Ok(status.code().unwrap_or(-1))
}

async fn run_step(
    program: &str,
    args: &[&str],
    cwd: &Path,
    envs: &[(String, String)],
    log_path: &Path,
) -> Result<ExitStatus> {
    let (stdout, stderr) = log_stdio(log_path)?;
    Command::new(program)
        .args(args)
        .current_dir(cwd)
        .envs(envs.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("run {program}"))
}

fn ensure_success(step: &'static str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(StepExit { step, status }.into())
    }
}

/// Both output streams append to the same log file.
fn log_stdio(log_path: &Path) -> Result<(Stdio, Stdio)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open build log {}", log_path.display()))?;
    let stderr = file
        .try_clone()
        .with_context(|| format!("clone build log handle {}", log_path.display()))?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

pub fn clone_url(clone_source: &str, owner: &str, repo: &str) -> String {
    if clone_source.ends_with(':') {
        format!("{clone_source}{owner}/{repo}.git")
    } else {
        format!("{}/{owner}/{repo}.git", clone_source.trim_end_matches('/'))
    }
}

fn build_env(context: &BuildContext, workspace: &Path) -> Vec<(String, String)> {
    let mut envs = vec![
        ("BUILD_OWNER".to_string(), context.event.owner.clone()),
        ("BUILD_REPO".to_string(), context.event.repo.clone()),
        ("BUILD_REF".to_string(), context.git_ref.clone()),
        ("BUILD_STATUS_REF".to_string(), context.event.status_ref.clone()),
        ("BUILD_EVENT".to_string(), context.event.event_name.clone()),
        ("BUILD_ACTION".to_string(), context.event.action.clone()),
        ("BUILD_STATUS_CONTEXT".to_string(), context.status_context.clone()),
        (
            "BUILD_RESULT_PATH".to_string(),
            path_string(&context.result_path),
        ),
        ("BUILD_WORKSPACE".to_string(), path_string(workspace)),
    ];
    if let Some(number) = context.event.pr_number {
        envs.push(("BUILD_PR_NUMBER".to_string(), number.to_string()));
    }
    envs
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn read_tail(path: &Path, limit: usize) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(limit);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(_) => String::new(),
    }
}
