use crate::config::EffectiveConfig;
use anyhow::{Result, anyhow};
use dispatch_core::identifiers::sanitize_component;
use dispatch_core::model::{ExecuteResult, HookEvent};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::path::{Component, Path, PathBuf};

/// Everything a build action gets to see. Owned, so the action can run on its
/// own task after the supervisor has stopped waiting for it.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub git_ref: String,
    pub result_path: PathBuf,
    pub config: EffectiveConfig,
    pub event: HookEvent,
    pub status_context: String,
}

impl BuildContext {
    /// Name of the result directory, unique per build.
    pub fn build_id(&self) -> String {
        self.result_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// `<workspace_root>/<owner>/<repo>/<ref>/<build-id>`.
    pub fn workspace_dir(&self) -> PathBuf {
        self.config
            .workspace_root
            .join(sanitize_component(&self.event.owner))
            .join(sanitize_component(&self.event.repo))
            .join(sanitize_component(&self.git_ref))
            .join(sanitize_component(&self.build_id()))
    }

    /// Where the repository is cloned inside the workspace. `PathToCloneIn`
    /// must stay relative to the workspace.
    pub fn clone_dir(&self) -> Result<PathBuf> {
        let workspace = self.workspace_dir();
        let Some(relative) = self.config.path_to_clone_in.as_deref() else {
            return Ok(workspace.join(sanitize_component(&self.event.repo)));
        };

        let relative = Path::new(relative);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(anyhow!(
                "PathToCloneIn must be a relative path inside the workspace: {}",
                relative.display()
            ));
        }

        Ok(workspace.join(relative))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    pub result: ExecuteResult,
    pub output: String,
}

/// An action error plus whatever the action produced before failing.
#[derive(Debug)]
pub struct ActionFailure {
    pub error: anyhow::Error,
    pub exit_code: Option<i32>,
    pub log_path: Option<PathBuf>,
    pub output: String,
}

impl ActionFailure {
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_log(mut self, log_path: PathBuf, output: String) -> Self {
        self.log_path = Some(log_path);
        self.output = output;
        self
    }
}

impl From<anyhow::Error> for ActionFailure {
    fn from(error: anyhow::Error) -> Self {
        Self {
            error,
            exit_code: None,
            log_path: None,
            output: String::new(),
        }
    }
}

/// The clone-and-build step, injected into the supervisor.
///
/// The returned future runs on its own task. When the deadline passes the task
/// is aborted, which only stops work that yields at an `.await`; actions that
/// spawn processes should set `kill_on_drop` so aborting reaps them. The
/// supervisor removes [`BuildContext::workspace_dir`] after an abort.
pub trait BuildAction: Send + Sync {
    fn execute(
        &self,
        context: BuildContext,
    ) -> BoxFuture<'static, Result<ActionOutput, ActionFailure>>;
}

impl<F, Fut, E> BuildAction for F
where
    F: Fn(BuildContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionOutput, E>> + Send + 'static,
    E: Into<ActionFailure>,
{
    fn execute(
        &self,
        context: BuildContext,
    ) -> BoxFuture<'static, Result<ActionOutput, ActionFailure>> {
        self(context)
            .map(|outcome| outcome.map_err(Into::<ActionFailure>::into))
            .boxed()
    }
}
