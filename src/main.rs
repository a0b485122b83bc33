use anyhow::{Context, Result, anyhow};
use build_dispatch::dispatcher::Dispatcher;
use build_dispatch::instance::Instance;
use build_dispatch::queue::{HookQueue, KafkaQueue};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config_root = required_env("DISPATCH_CONFIG_ROOT")?;
    let global = build_dispatch::config::resolve_global(Path::new(&config_root))
        .context("load global build configuration")?;
    let queue: Arc<dyn HookQueue> =
        Arc::new(KafkaQueue::from_config(&global).context("initialize kafka queue")?);

    let mut instance = Instance::new(&config_root).with_queue(queue.clone());
    if let Some(status_context) = optional_env("DISPATCH_STATUS_CONTEXT") {
        instance = instance.with_status_context(status_context);
    }
    let instance = Arc::new(instance);

    let queue_name = instance
        .prepare_queue()
        .await
        .context("prepare build queue")?;
    info!(
        config_root = %config_root,
        queue = %queue_name,
        max_concurrent_builds = global.max_concurrent_builds,
        "build dispatcher ready"
    );

    let dispatcher = Dispatcher::new(instance, queue, queue_name, global.max_concurrent_builds);
    dispatcher
        .run_until(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "failed to listen for ctrl-c");
            }
        })
        .await
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn required_env(name: &str) -> Result<String> {
    optional_env(name).ok_or_else(|| anyhow!("missing required environment variable: {name}"))
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
