use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// A normalized repository webhook notification.
///
/// `git_ref` is what gets fetched and checked out; `status_ref` is the commit
/// the build reports against. Both come from the listener and are never
/// rewritten afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookEvent {
    pub owner: String,
    pub repo: String,
    pub event_name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub git_ref: String,
    #[serde(default)]
    pub status_ref: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl HookEvent {
    /// Event for an explicit, operator-requested build of `git_ref`.
    pub fn for_ref(owner: &str, repo: &str, git_ref: &str) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            event_name: "push".to_string(),
            git_ref: git_ref.to_string(),
            status_ref: git_ref.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl ExecuteResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Succeeded,
    Failed,
    Errored,
    TimedOut,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::TimedOut => "timed_out",
        }
    }
}

/// Contents of `result.json`, written next to `hook.json` once a build ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

/// Queue payload produced by the webhook listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub received_at: String,
    pub payload: Value,
}

impl WebhookEnvelope {
    /// The bare event name: `pull_request` for an `event_type` of
    /// `pull_request.opened`.
    pub fn event_name(&self) -> &str {
        self.event_type
            .split_once('.')
            .map_or(self.event_type.as_str(), |(name, _)| name)
    }
}
