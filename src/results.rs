//! On-disk build records.
//!
//! Layout: `<result_root>/<owner>/<repo>/<build-id>/` holding `hook.json`,
//! written before the build action starts, and `result.json`, written once the
//! action finishes, fails or times out.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use dispatch_core::identifiers::sanitize_component;
use dispatch_core::model::{BuildReport, HookEvent};
use serde::Serialize;
#[cfg(test)]
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

pub const HOOK_FILE_NAME: &str = "hook.json";
pub const RESULT_FILE_NAME: &str = "result.json";

const MAX_CREATE_ATTEMPTS: u32 = 16;

static BUILD_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Creates a fresh, never-reused directory for one build of `owner/repo`.
///
/// Uniqueness comes from `create_dir` refusing existing paths; the timestamp
/// and in-process sequence just make collisions rare and names sortable.
pub async fn create_result_dir(result_root: &Path, owner: &str, repo: &str) -> Result<PathBuf> {
    let repo_root = result_root
        .join(sanitize_component(owner))
        .join(sanitize_component(repo));
    tokio::fs::create_dir_all(&repo_root)
        .await
        .with_context(|| format!("create result directory {}", repo_root.display()))?;

    for _ in 0..MAX_CREATE_ATTEMPTS {
        let candidate = repo_root.join(next_build_id());
        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("create build directory {}", candidate.display()));
            }
        }
    }

    Err(anyhow!(
        "could not allocate a unique build directory under {} after {MAX_CREATE_ATTEMPTS} attempts",
        repo_root.display()
    ))
}

pub fn next_build_id() -> String {
    let sequence = BUILD_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    format!("{}-{sequence:06}", Utc::now().format("%Y%m%dT%H%M%S%.9fZ"))
}

pub async fn record_hook(result_path: &Path, event: &HookEvent) -> Result<()> {
    write_json_atomic(&result_path.join(HOOK_FILE_NAME), event)
        .await
        .context("record hook event")
}

pub async fn record_report(result_path: &Path, report: &BuildReport) -> Result<()> {
    write_json_atomic(&result_path.join(RESULT_FILE_NAME), report)
        .await
        .context("record build report")
}

#[cfg(test)]
pub(crate) async fn load_hook(result_path: &Path) -> Result<HookEvent> {
    read_json(&result_path.join(HOOK_FILE_NAME)).await
}

#[cfg(test)]
pub(crate) async fn load_report(result_path: &Path) -> Result<BuildReport> {
    read_json(&result_path.join(RESULT_FILE_NAME)).await
}

/// Writes through a temporary file and renames it into place so readers never
/// see a half-written record.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(value).context("serialize JSON")?;
    let temporary = path.with_extension("json.tmp");

    let mut file = tokio::fs::File::create(&temporary)
        .await
        .with_context(|| format!("create {}", temporary.display()))?;
    file.write_all(&serialized)
        .await
        .with_context(|| format!("write {}", temporary.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("sync {}", temporary.display()))?;
    drop(file);

    tokio::fs::rename(&temporary, path)
        .await
        .with_context(|| format!("rename {} into place", path.display()))
}

#[cfg(test)]
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
}
