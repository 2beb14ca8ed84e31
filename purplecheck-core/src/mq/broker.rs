//! Broker contract: typed publish/consume with manual acknowledgement

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Role;
use crate::mq::topology::QueueBinding;
use crate::{Error, Result};

/// Acknowledgement handle carried by each delivery. Dropping a delivery
/// without acking behaves like a channel close: the message returns to the
/// queue for redelivery.
#[async_trait]
pub trait DeliveryAck: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
    /// Detach from the broker so dropping the delivery settles nothing.
    /// Only the broker itself uses this, when a handoff fails mid-dispatch.
    fn defuse(&mut self);
}

/// One message handed to a consumer. Exactly one of `ack`/`nack` must be
/// called after the corresponding database transaction commits (or fails).
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub queue: String,
    pub redelivered: bool,
    /// Broker-side redelivery counter, used for poison detection
    pub delivery_count: u32,
    pub(crate) acker: Box<dyn DeliveryAck>,
}

impl Delivery {
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .field("bytes", &self.body.len())
            .finish()
    }
}

/// Typed access to the topic-routed broker. Connections are per-role; all
/// published messages are persistent; consumers use manual acknowledgement
/// with a bounded prefetch window.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare exchange, queues, and bindings. Idempotent; safe to re-run
    /// after a reconnect.
    async fn declare_topology(&self, bindings: &[QueueBinding]) -> Result<()>;

    /// Publish one persistent message to the exchange
    async fn publish(&self, role: Role, routing_key: &str, body: Vec<u8>) -> Result<()>;

    /// Open a consumer on `queue` with at most `prefetch` unacked deliveries
    async fn subscribe(
        &self,
        role: Role,
        queue: &str,
        prefetch: usize,
    ) -> Result<mpsc::Receiver<Delivery>>;

    /// Close channels and connections
    async fn close(&self);
}

/// Backoff policy for transient publish failures: bounded exponential,
/// 500ms to 30s, with jitter.
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(5)
        .with_jitter()
}

/// Publish a rejected message to the dead-letter route, wrapped with the
/// source queue and an error tag so operators can triage and replay it.
pub async fn dead_letter(
    broker: &dyn Broker,
    role: Role,
    routing_key: &str,
    source_queue: &str,
    reason: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<()> {
    let wrapper = crate::codec::DeadLetter::new(source_queue, reason, payload);
    let body = crate::codec::encode(&wrapper)?;
    tracing::warn!(queue = source_queue, reason, "dead-lettering message");
    publish_with_retry(broker, role, routing_key, body, timeout).await
}

/// Publish with a per-attempt timeout and transient-failure retry. The
/// final error propagates so the enclosing delivery is nacked.
pub async fn publish_with_retry(
    broker: &dyn Broker,
    role: Role,
    routing_key: &str,
    body: Vec<u8>,
    timeout: Duration,
) -> Result<()> {
    let attempt = || {
        let body = body.clone();
        async move {
            tokio::time::timeout(timeout, broker.publish(role, routing_key, body))
                .await
                .map_err(|_| Error::Transient(format!("publish to '{routing_key}' timed out")))?
        }
    };

    attempt
        .retry(publish_backoff())
        .when(Error::is_transient)
        .notify(|err, delay| {
            tracing::warn!(
                routing_key,
                ?delay,
                error = %err,
                "transient publish failure, backing off"
            );
        })
        .await
}
