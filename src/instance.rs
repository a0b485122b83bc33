use crate::action::BuildAction;
use crate::config::{self, EffectiveConfig};
use crate::error::BuildError;
use crate::queue::{self, HookQueue};
use crate::shell::ShellBuildAction;
use crate::supervisor::on_hook_build;
use anyhow::{Result, anyhow};
use dispatch_core::filters::should_skip;
use dispatch_core::model::{ExecuteResult, HookEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Handle shared by everything that builds: where configuration lives, how to
/// reach the queue and which action runs a build.
#[derive(Clone)]
pub struct Instance {
    config_root: PathBuf,
    queue: Option<Arc<dyn HookQueue>>,
    action: Arc<dyn BuildAction>,
    status_context: Option<String>,
}

impl Instance {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
            queue: None,
            action: Arc::new(ShellBuildAction),
            status_context: None,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn HookQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_action(mut self, action: Arc<dyn BuildAction>) -> Self {
        self.action = action;
        self
    }

    /// Overrides the `StatusContext` from configuration for every build.
    pub fn with_status_context(mut self, status_context: impl Into<String>) -> Self {
        self.status_context = Some(status_context.into());
        self
    }

    pub fn global_config(&self) -> Result<EffectiveConfig> {
        config::resolve_global(&self.config_root)
    }

    /// Resolves the global configuration and makes sure its queue exists.
    pub async fn prepare_queue(&self) -> Result<String> {
        let queue = self
            .queue
            .as_deref()
            .ok_or_else(|| anyhow!("instance has no queue client"))?;
        let config = self.global_config()?;
        queue::prepare_queue(&config, queue).await
    }

    /// Builds `git_ref` of `owner/repo` as if a push had arrived for it.
    pub async fn build_ref(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<ExecuteResult, BuildError> {
        self.build_event(&HookEvent::for_ref(owner, repo, git_ref))
            .await
    }

    pub async fn build_event(&self, event: &HookEvent) -> Result<ExecuteResult, BuildError> {
        let config = self.repo_config(event).await?;
        let status_context = self
            .status_context
            .clone()
            .unwrap_or_else(|| config.status_context.clone());

        on_hook_build(
            &event.git_ref,
            &config,
            event,
            &status_context,
            self.action.clone(),
        )
        .await
    }

    /// Reads the global and repository documents off the async workers.
    async fn repo_config(&self, event: &HookEvent) -> Result<EffectiveConfig, BuildError> {
        let config_root = self.config_root.clone();
        let owner = event.owner.clone();
        let repo = event.repo.clone();
        tokio::task::spawn_blocking(move || config::resolve_for_repo(&config_root, &owner, &repo))
            .await
            .map_err(|join_error| {
                BuildError::Config(anyhow!("configuration task did not complete: {join_error}"))
            })?
            .map_err(BuildError::Config)
    }

    /// Filters `event` and builds it when admitted. `Ok(None)` means skipped.
    pub async fn handle_event(
        &self,
        event: &HookEvent,
    ) -> Result<Option<ExecuteResult>, BuildError> {
        if let Some(reason) = should_skip(event) {
            info!(
                owner = %event.owner,
                repo = %event.repo,
                event = %event.event_name,
                action = %event.action,
                reason,
                "skipping hook event"
            );
            return Ok(None);
        }

        self.build_event(event).await.map(Some)
    }
}
