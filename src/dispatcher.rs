use crate::error::BuildError;
use crate::instance::Instance;
use crate::queue::{Delivery, HookQueue};
use anyhow::{Context, Result};
use dispatch_core::model::{ExecuteResult, HookEvent, WebhookEnvelope};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

type BuildOutcome = Result<Option<ExecuteResult>, BuildError>;

/// Pulls hook envelopes off the build queue and runs admitted ones, at most
/// `max_concurrent` at a time.
pub struct Dispatcher {
    instance: Arc<Instance>,
    queue: Arc<dyn HookQueue>,
    queue_name: String,
    max_concurrent: usize,
}

impl Dispatcher {
    pub fn new(
        instance: Arc<Instance>,
        queue: Arc<dyn HookQueue>,
        queue_name: impl Into<String>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            instance,
            queue,
            queue_name: queue_name.into(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Runs until `shutdown` resolves, then waits for builds already started.
    ///
    /// Every delivery is acknowledged as soon as it is decoded, before
    /// `hook.json` is written. A crash between the acknowledgement and
    /// `record_hook` loses that event with no record on disk. Builds that fail
    /// afterwards are logged and not retried.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut builds: JoinSet<BuildOutcome> = JoinSet::new();
        tokio::pin!(shutdown);

        info!(
            queue = %self.queue_name,
            max_concurrent = self.max_concurrent,
            "dispatcher started"
        );

        loop {
            while let Some(joined) = builds.try_join_next() {
                log_finished(joined);
            }

            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => {
                    permit.context("build semaphore closed")?
                }
            };

            let received = tokio::select! {
                _ = &mut shutdown => break,
                received = self.queue.dequeue(&self.queue_name) => received,
            };
            let delivery = match received {
                Ok(delivery) => delivery,
                Err(error) => {
                    warn!(queue = %self.queue_name, error = %error, "queue receive error");
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                    continue;
                }
            };

            let decoded = decode_delivery(&delivery);
            self.acknowledge(&delivery).await;

            if let Some(event) = decoded {
                let instance = self.instance.clone();
                builds.spawn(async move {
                    let _permit = permit;
                    instance.handle_event(&event).await
                });
            }
        }

        info!(in_flight = builds.len(), "dispatcher stopping, waiting for builds");
        while let Some(joined) = builds.join_next().await {
            log_finished(joined);
        }
        info!("dispatcher stopped");
        Ok(())
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        if let Err(error) = self.queue.acknowledge(delivery).await {
            warn!(
                queue = %delivery.queue,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %error,
                "failed to acknowledge delivery"
            );
        }
    }
}

/// Undecodable deliveries are logged here and dropped.
fn decode_delivery(delivery: &Delivery) -> Option<HookEvent> {
    match decode(&delivery.payload) {
        Ok(event) => Some(event),
        Err(error) => {
            warn!(
                queue = %delivery.queue,
                offset = delivery.offset,
                error = %format!("{error:#}"),
                "dropping undecodable delivery"
            );
            None
        }
    }
}

fn decode(payload: &[u8]) -> Result<HookEvent> {
    let envelope: WebhookEnvelope =
        serde_json::from_slice(payload).context("deserialize webhook envelope")?;
    HookEvent::from_envelope(&envelope)
        .with_context(|| format!("normalize envelope {}", envelope.id))
}

fn log_finished(joined: Result<BuildOutcome, JoinError>) {
    match joined {
        Ok(Ok(Some(result))) => debug!(exit_code = result.exit_code, "build task finished"),
        Ok(Ok(None)) => {}
        // The supervisor already logged the failure with its coordinates.
        Ok(Err(error)) => debug!(kind = error.kind(), "build task failed"),
        Err(error) => warn!(error = %error, "build task panicked or was cancelled"),
    }
}
