//! In-process topic broker
//!
//! Implements the `Broker` contract over process-local queues: topic-pattern
//! routing, per-consumer prefetch windows, manual ack with redelivery on
//! nack, a redelivery counter, and poison dead-lettering. Used by the
//! supervisor in single-process deployments and by the test suite; a
//! network-broker backend plugs in behind the same trait.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Role;
use crate::mq::broker::{Broker, Delivery, DeliveryAck};
use crate::mq::topology::{self, QueueBinding};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    routing_key: String,
    delivery_count: u32,
    redelivered: bool,
}

struct ConsumerSlot {
    tx: mpsc::Sender<Delivery>,
    prefetch: usize,
    in_flight: usize,
    closed: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (usize, StoredMessage)>,
    consumers: Vec<ConsumerSlot>,
}

struct BrokerState {
    bindings: Vec<QueueBinding>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    max_redeliveries: u32,
}

/// Topic broker living entirely in this process
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                bindings: Vec::new(),
                queues: HashMap::new(),
                next_tag: 0,
                max_redeliveries,
            })),
        }
    }

    /// (ready, unacked) depths for one queue; test and operator visibility
    pub fn queue_stats(&self, queue: &str) -> Option<(usize, usize)> {
        let state = lock(&self.state);
        state
            .queues
            .get(queue)
            .map(|q| (q.ready.len(), q.unacked.len()))
    }
}

fn lock(state: &Arc<Mutex<BrokerState>>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hand ready messages to consumers with free prefetch slots
fn pump(arc: &Arc<Mutex<BrokerState>>, state: &mut BrokerState, queue_name: &str) {
    loop {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        if queue.ready.is_empty() {
            return;
        }
        let Some(slot_idx) = queue
            .consumers
            .iter()
            .position(|c| !c.closed && c.in_flight < c.prefetch)
        else {
            return;
        };

        let message = match queue.ready.pop_front() {
            Some(m) => m,
            None => return,
        };
        state.next_tag += 1;
        let tag = state.next_tag;

        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let delivery = Delivery {
            body: message.body.clone(),
            routing_key: message.routing_key.clone(),
            queue: queue_name.to_string(),
            redelivered: message.redelivered,
            delivery_count: message.delivery_count,
            acker: Box::new(MemoryAcker {
                state: arc.clone(),
                queue: queue_name.to_string(),
                tag,
                settled: false,
            }),
        };

        let slot = &mut queue.consumers[slot_idx];
        match slot.tx.try_send(delivery) {
            Ok(()) => {
                slot.in_flight += 1;
                queue.unacked.insert(tag, (slot_idx, message));
            }
            Err(err) => {
                // receiver gone; treat the consumer as cancelled. The
                // returned delivery must not settle on drop while we hold
                // the state lock.
                slot.closed = true;
                let mut delivery = match err {
                    mpsc::error::TrySendError::Full(d)
                    | mpsc::error::TrySendError::Closed(d) => d,
                };
                delivery.acker.defuse();
                queue.ready.push_front(message);
            }
        }
    }
}

fn settle(
    arc: &Arc<Mutex<BrokerState>>,
    queue_name: &str,
    tag: u64,
    requeue: Option<bool>,
) {
    let mut state = lock(arc);
    let max_redeliveries = state.max_redeliveries;

    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };
    let Some((slot_idx, mut message)) = queue.unacked.remove(&tag) else {
        return;
    };
    if let Some(slot) = queue.consumers.get_mut(slot_idx) {
        slot.in_flight = slot.in_flight.saturating_sub(1);
    }

    match requeue {
        None => {} // acked
        Some(true) => {
            message.delivery_count += 1;
            message.redelivered = true;
            if message.delivery_count > max_redeliveries {
                tracing::warn!(
                    queue = queue_name,
                    routing_key = %message.routing_key,
                    delivery_count = message.delivery_count,
                    "poison message exceeded redelivery budget, dead-lettering"
                );
                state
                    .queues
                    .entry(topology::DEAD_LETTER_QUEUE.to_string())
                    .or_default()
                    .ready
                    .push_back(message);
                pump(arc, &mut state, topology::DEAD_LETTER_QUEUE);
                pump(arc, &mut state, queue_name);
                return;
            }
            queue.ready.push_front(message);
        }
        Some(false) => {
            // explicit reject without requeue goes straight to dead-letter
            state
                .queues
                .entry(topology::DEAD_LETTER_QUEUE.to_string())
                .or_default()
                .ready
                .push_back(message);
            pump(arc, &mut state, topology::DEAD_LETTER_QUEUE);
        }
    }
    pump(arc, &mut state, queue_name);
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
    settled: bool,
}

#[async_trait]
impl DeliveryAck for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.settled = true;
        settle(&self.state, &self.queue, self.tag, None);
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<()> {
        self.settled = true;
        settle(&self.state, &self.queue, self.tag, Some(requeue));
        Ok(())
    }

    fn defuse(&mut self) {
        self.settled = true;
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        // an unsettled delivery behaves like a channel close: back to the queue
        if !self.settled {
            settle(&self.state, &self.queue, self.tag, Some(true));
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_topology(&self, bindings: &[QueueBinding]) -> Result<()> {
        let mut state = lock(&self.state);
        for binding in bindings {
            state.queues.entry(binding.queue.clone()).or_default();
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
        }
        state
            .queues
            .entry(topology::DEAD_LETTER_QUEUE.to_string())
            .or_default();
        tracing::debug!(bindings = bindings.len(), "declared broker topology");
        Ok(())
    }

    async fn publish(&self, role: Role, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let mut state = lock(&self.state);
        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| topology::topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        if targets.is_empty() {
            tracing::debug!(role = role.as_str(), routing_key, "unroutable message dropped");
            return Ok(());
        }

        for queue_name in targets {
            state
                .queues
                .entry(queue_name.clone())
                .or_default()
                .ready
                .push_back(StoredMessage {
                    body: body.clone(),
                    routing_key: routing_key.to_string(),
                    delivery_count: 0,
                    redelivered: false,
                });
            pump(&self.state, &mut state, &queue_name);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        role: Role,
        queue: &str,
        prefetch: usize,
    ) -> Result<mpsc::Receiver<Delivery>> {
        if prefetch == 0 {
            return Err(Error::Broker("prefetch must be positive".into()));
        }
        let (tx, rx) = mpsc::channel(prefetch);
        let mut state = lock(&self.state);
        if !state.queues.contains_key(queue) {
            return Err(Error::Broker(format!("unknown queue '{queue}'")));
        }
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(ConsumerSlot {
                tx,
                prefetch,
                in_flight: 0,
                closed: false,
            });
        }
        tracing::debug!(role = role.as_str(), queue, prefetch, "consumer subscribed");
        pump(&self.state, &mut state, queue);
        Ok(rx)
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        for queue in state.queues.values_mut() {
            for consumer in &mut queue.consumers {
                consumer.closed = true;
            }
        }
    }
}
