use anyhow::{Context, Result, anyhow};
use build_dispatch::config;
use build_dispatch::instance::Instance;
use build_dispatch::queue::{self, HookQueue, KafkaQueue};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use dispatch_core::model::WebhookEnvelope;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dispatchctl", version, about = "Operate a build-dispatch installation")]
struct Cli {
    /// Directory holding config.json and per-repository overlays.
    #[arg(long, env = "DISPATCH_CONFIG_ROOT")]
    config_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a ref locally with the configured clone-and-build action.
    Build {
        owner: String,
        repo: String,
        git_ref: String,
        #[arg(long, env = "DISPATCH_STATUS_CONTEXT")]
        status_context: Option<String>,
    },
    /// Print the resolved configuration with secrets redacted.
    CheckConfig {
        #[arg(long, requires = "repo")]
        owner: Option<String>,
        #[arg(long, requires = "owner")]
        repo: Option<String>,
    },
    /// Create the build queue if it does not exist yet.
    PrepareQueue,
    /// Publish a synthetic GitHub event onto the build queue.
    Enqueue {
        owner: String,
        repo: String,
        #[arg(long, default_value = "refs/heads/main")]
        git_ref: String,
        /// Commit reported as the push `after` or pull request head.
        #[arg(long)]
        sha: Option<String>,
        /// Send a pull_request event for this number instead of a push.
        #[arg(long)]
        pull_request: Option<u64>,
        #[arg(long, default_value = "opened")]
        action: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Build {
            owner,
            repo,
            git_ref,
            status_context,
        } => {
            let mut instance = Instance::new(&cli.config_root);
            if let Some(status_context) = status_context {
                instance = instance.with_status_context(status_context);
            }
            let result = instance
                .build_ref(&owner, &repo, &git_ref)
                .await
                .with_context(|| format!("build {owner}/{repo}@{git_ref}"))?;
            if let Some(log_path) = &result.log_path {
                println!("log: {}", log_path.display());
            }
            if !result.success() {
                return Err(anyhow!("build exited with code {}", result.exit_code));
            }
            println!("build succeeded");
        }
        Command::CheckConfig { owner, repo } => {
            let resolved = match (owner.as_deref(), repo.as_deref()) {
                (Some(owner), Some(repo)) => {
                    config::resolve_for_repo(&cli.config_root, owner, repo)?
                }
                _ => config::resolve_global(&cli.config_root)?,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&resolved).context("serialize configuration")?
            );
        }
        Command::PrepareQueue => {
            let global = config::resolve_global(&cli.config_root)?;
            let kafka: Arc<dyn HookQueue> = Arc::new(KafkaQueue::from_config(&global)?);
            let name = Instance::new(&cli.config_root)
                .with_queue(kafka)
                .prepare_queue()
                .await?;
            println!("{name}");
        }
        Command::Enqueue {
            owner,
            repo,
            git_ref,
            sha,
            pull_request,
            action,
        } => {
            let global = config::resolve_global(&cli.config_root)?;
            let kafka = KafkaQueue::from_config(&global)?;
            let name = queue::prepare_queue(&global, &kafka).await?;
            let envelope = synthetic_envelope(
                &owner,
                &repo,
                &git_ref,
                sha.as_deref(),
                pull_request,
                &action,
            );
            kafka
                .enqueue(&name, &envelope)
                .await
                .with_context(|| format!("enqueue onto {name}"))?;
            info!(queue = %name, event_id = %envelope.id, event_type = %envelope.event_type, "enqueued synthetic event");
            println!("{}", envelope.id);
        }
    }

    Ok(())
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Builds the envelope the webhook listener would have produced for a push or
/// pull request.
fn synthetic_envelope(
    owner: &str,
    repo: &str,
    git_ref: &str,
    sha: Option<&str>,
    pull_request: Option<u64>,
    action: &str,
) -> WebhookEnvelope {
    let repository = json!({"name": repo, "owner": {"login": owner, "name": owner}});
    let commit = sha.unwrap_or(git_ref);

    let (event_type, payload) = match pull_request {
        Some(number) => (
            format!("pull_request.{action}"),
            json!({
                "action": action,
                "number": number,
                "pull_request": {"number": number, "head": {"sha": commit}},
                "repository": repository,
            }),
        ),
        None => (
            "push".to_string(),
            json!({
                "ref": git_ref,
                "after": commit,
                "deleted": false,
                "repository": repository,
            }),
        ),
    };

    WebhookEnvelope {
        id: uuid::Uuid::new_v4().to_string(),
        source: "github".to_string(),
        event_type,
        received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        payload,
    }
}
