use crate::config::{EffectiveConfig, checked_queue_name};
use anyhow::{Context, Result, anyhow};
use dispatch_core::model::WebhookEnvelope;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// One message taken off the queue, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Transport the dispatcher pulls hook envelopes from.
///
/// `ensure_queue` must be idempotent. Redelivery of unacknowledged messages
/// follows the backing service's own policy.
pub trait HookQueue: Send + Sync {
    fn ensure_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    fn enqueue<'a>(
        &'a self,
        name: &'a str,
        envelope: &'a WebhookEnvelope,
    ) -> BoxFuture<'a, Result<()>>;

    fn dequeue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Delivery>>;

    fn acknowledge<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>>;
}

/// Truncates the configured queue name if needed and asks the queue service to
/// create or look it up. Returns the identifier actually used.
pub async fn prepare_queue(config: &EffectiveConfig, queue: &dyn HookQueue) -> Result<String> {
    let name = checked_queue_name(&config.queue_name);
    queue
        .ensure_queue(&name)
        .await
        .with_context(|| format!("ensure queue {name}"))?;
    info!(queue = %name, "build queue ready");
    Ok(name)
}

pub struct KafkaQueue {
    admin: AdminClient<DefaultClientContext>,
    producer: FutureProducer,
    consumer: StreamConsumer,
    topic_partitions: i32,
    topic_replication_factor: i32,
    subscription: Mutex<Option<String>>,
}

impl KafkaQueue {
    pub fn from_config(config: &EffectiveConfig) -> Result<Self> {
        let admin = client_config(config)
            .create::<AdminClient<DefaultClientContext>>()
            .context("create kafka admin client")?;

        let producer = client_config(config)
            .set("message.timeout.ms", "5000")
            .set("queue.buffering.max.ms", "5")
            .create::<FutureProducer>()
            .context("create kafka future producer")?;

        let consumer = client_config(config)
            .set("group.id", consumer_group(&config.queue_name))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create::<StreamConsumer>()
            .context("create kafka stream consumer")?;

        Ok(Self {
            admin,
            producer,
            consumer,
            topic_partitions: config.kafka_topic_partitions,
            topic_replication_factor: config.kafka_topic_replication_factor,
            subscription: Mutex::new(None),
        })
    }

    fn subscribe(&self, name: &str) -> Result<()> {
        let mut subscription = self
            .subscription
            .lock()
            .map_err(|_| anyhow!("kafka subscription lock poisoned"))?;
        if subscription.as_deref() == Some(name) {
            return Ok(());
        }

        self.consumer
            .subscribe(&[name])
            .with_context(|| format!("subscribe to topic {name}"))?;
        *subscription = Some(name.to_string());
        Ok(())
    }
}

impl HookQueue for KafkaQueue {
    fn ensure_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let topic = NewTopic::new(
                name,
                self.topic_partitions,
                TopicReplication::Fixed(self.topic_replication_factor),
            );
            let results = self
                .admin
                .create_topics([&topic], &AdminOptions::new())
                .await
                .context("create kafka topic")?;

            for result in results {
                match result {
                    Ok(created) => info!(topic = %created, "created kafka topic"),
                    Err((existing, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        debug!(topic = %existing, "kafka topic already exists");
                    }
                    Err((failed, code)) => {
                        return Err(anyhow!("create kafka topic {failed} failed: {code}"));
                    }
                }
            }

            self.subscribe(name)
        }
        .boxed()
    }

    fn enqueue<'a>(
        &'a self,
        name: &'a str,
        envelope: &'a WebhookEnvelope,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let payload =
                serde_json::to_string(envelope).context("serialize webhook envelope")?;
            let record = FutureRecord::to(name)
                .key(envelope.id.as_str())
                .payload(&payload);
            self.producer
                .send(record, Timeout::After(Duration::from_secs(5)))
                .await
                .map_err(|(error, _message)| anyhow!("kafka publish failed: {error}"))?;
            Ok(())
        }
        .boxed()
    }

    fn dequeue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Delivery>> {
        async move {
            self.subscribe(name)?;
            let message = self
                .consumer
                .recv()
                .await
                .context("receive kafka message")?;
            Ok(Delivery {
                queue: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                payload: message.payload().unwrap_or_default().to_vec(),
            })
        }
        .boxed()
    }

    fn acknowledge<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut offsets = TopicPartitionList::new();
            offsets
                .add_partition_offset(
                    &delivery.queue,
                    delivery.partition,
                    Offset::Offset(delivery.offset + 1),
                )
                .context("build kafka commit offsets")?;
            self.consumer
                .commit(&offsets, CommitMode::Async)
                .context("commit kafka offset")
        }
        .boxed()
    }
}

fn client_config(config: &EffectiveConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("security.protocol", &config.kafka_security_protocol);

    if uses_sasl(&config.kafka_security_protocol) {
        client
            .set("sasl.mechanism", &config.kafka_sasl_mechanism)
            .set("sasl.username", &config.kafka_username)
            .set("sasl.password", config.kafka_password.expose());
    }

    client
}

fn uses_sasl(security_protocol: &str) -> bool {
    security_protocol.trim().to_ascii_uppercase().starts_with("SASL")
}

pub fn consumer_group(queue_name: &str) -> String {
    format!("{queue_name}-builders")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::Notify;

    /// Single-process stand-in for the queue service.
    #[derive(Default)]
    pub(crate) struct MemoryQueue {
        queues: Mutex<HashMap<String, VecDeque<Delivery>>>,
        ensure_calls: Mutex<Vec<String>>,
        acknowledged: Mutex<Vec<i64>>,
        next_offset: AtomicI64,
        arrivals: Notify,
    }

    impl MemoryQueue {
        pub(crate) fn ensure_calls(&self) -> Vec<String> {
            self.ensure_calls.lock().expect("lock").clone()
        }

        pub(crate) fn queue_names(&self) -> Vec<String> {
            self.queues.lock().expect("lock").keys().cloned().collect()
        }

        pub(crate) fn acknowledged(&self) -> Vec<i64> {
            self.acknowledged.lock().expect("lock").clone()
        }

        pub(crate) fn push_raw(&self, name: &str, payload: Vec<u8>) -> Result<()> {
            let mut queues = self.queues.lock().expect("lock");
            let queue = queues
                .get_mut(name)
                .ok_or_else(|| anyhow!("queue {name} does not exist"))?;
            queue.push_back(Delivery {
                queue: name.to_string(),
                partition: 0,
                offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
                payload,
            });
            drop(queues);
            self.arrivals.notify_one();
            Ok(())
        }

        fn pop(&self, name: &str) -> Option<Delivery> {
            self.queues
                .lock()
                .expect("lock")
                .get_mut(name)
                .and_then(VecDeque::pop_front)
        }
    }

    impl HookQueue for MemoryQueue {
        fn ensure_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
            async move {
                self.queues
                    .lock()
                    .expect("lock")
                    .entry(name.to_string())
                    .or_default();
                self.ensure_calls.lock().expect("lock").push(name.to_string());
                Ok(())
            }
            .boxed()
        }

        fn enqueue<'a>(
            &'a self,
            name: &'a str,
            envelope: &'a WebhookEnvelope,
        ) -> BoxFuture<'a, Result<()>> {
            async move {
                let payload = serde_json::to_vec(envelope).context("serialize envelope")?;
                self.push_raw(name, payload)
            }
            .boxed()
        }

        fn dequeue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Delivery>> {
            async move {
                loop {
                    if let Some(delivery) = self.pop(name) {
                        return Ok(delivery);
                    }
                    self.arrivals.notified().await;
                }
            }
            .boxed()
        }

        fn acknowledge<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>> {
            async move {
                self.acknowledged
                    .lock()
                    .expect("lock")
                    .push(delivery.offset);
                Ok(())
            }
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryQueue;
    use super::*;
    use crate::test_utils::LogCapture;
    use dispatch_core::identifiers::{QUEUE_NAME_FIELD, truncated_message};
    use serde_json::json;

    #[tokio::test]
    async fn over_length_queue_name_is_truncated_and_logged() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let queue = MemoryQueue::default();
        let config = EffectiveConfig {
            queue_name: "12345678901234567890".to_string(),
            ..EffectiveConfig::default()
        };

        let name = prepare_queue(&config, &queue).await.expect("prepare");

        assert_eq!(name, "123456789012345");
        assert_eq!(queue.queue_names(), vec!["123456789012345".to_string()]);
        assert!(logs.contents().contains(&truncated_message(QUEUE_NAME_FIELD)));
    }

    #[tokio::test]
    async fn preparing_twice_creates_one_queue() {
        let queue = MemoryQueue::default();
        let config = EffectiveConfig::default();

        let first = prepare_queue(&config, &queue).await.expect("first");
        let second = prepare_queue(&config, &queue).await.expect("second");

        assert_eq!(first, second);
        assert_eq!(queue.queue_names().len(), 1);
        assert_eq!(queue.ensure_calls().len(), 2);
    }

    #[tokio::test]
    async fn short_queue_name_is_not_logged_as_truncated() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let queue = MemoryQueue::default();

        prepare_queue(&EffectiveConfig::default(), &queue)
            .await
            .expect("prepare");

        assert!(!logs.contents().contains("was truncated"));
    }

    #[tokio::test]
    async fn memory_queue_delivers_in_order_and_records_acks() {
        let queue = MemoryQueue::default();
        queue.ensure_queue("q").await.expect("ensure");
        let envelope = WebhookEnvelope {
            id: "id-1".to_string(),
            source: "github".to_string(),
            event_type: "push".to_string(),
            received_at: "2026-01-01T00:00:00Z".to_string(),
            payload: json!({}),
        };

        queue.enqueue("q", &envelope).await.expect("enqueue");
        queue.push_raw("q", b"second".to_vec()).expect("push");

        let first = queue.dequeue("q").await.expect("first");
        let second = queue.dequeue("q").await.expect("second");
        assert_eq!(first.offset, 0);
        assert_eq!(second.payload, b"second".to_vec());

        queue.acknowledge(&first).await.expect("ack");
        assert_eq!(queue.acknowledged(), vec![0]);
        assert!(queue.enqueue("missing", &envelope).await.is_err());
    }

    #[test]
    fn sasl_settings_only_for_sasl_protocols() {
        assert!(uses_sasl("SASL_SSL"));
        assert!(uses_sasl("sasl_plaintext"));
        assert!(!uses_sasl("SSL"));
        assert!(!uses_sasl("PLAINTEXT"));
    }

    #[test]
    fn consumer_group_is_derived_from_queue_name() {
        assert_eq!(consumer_group("ci"), "ci-builders");
    }
}
