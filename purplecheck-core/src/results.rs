//! Result consumer for worker detection responses
//!
//! Consumes both response queues, appends one detection result row per
//! message, and drives the owning detection execution to its terminal
//! state. Duplicate responses append audit-visible duplicate rows but never
//! move a terminal status.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Outcome, ResponseEnvelope};
use crate::config::{EngineConfig, Role};
use crate::mq::broker::dead_letter;
use crate::mq::{topology, Broker, Delivery};
use crate::store::{DetectionStatus, NewDetectionResult, Store, TransitionPatch};
use crate::{Error, Result};

pub struct ResultConsumer {
    store: Store,
    broker: Arc<dyn Broker>,
    config: EngineConfig,
}

impl ResultConsumer {
    pub fn new(store: Store, broker: Arc<dyn Broker>, config: EngineConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    /// Consume both response queues until cancelled, then drain
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let prefetch = self.config.broker.prefetch;
        let mut api_rx = self
            .broker
            .subscribe(Role::ResultConsumer, topology::API_RESPONSES_QUEUE, prefetch)
            .await?;
        let mut agent_rx = self
            .broker
            .subscribe(
                Role::ResultConsumer,
                topology::AGENT_RESPONSES_QUEUE,
                prefetch,
            )
            .await?;
        let pool_size = self.config.worker.pool_size;
        let semaphore = Arc::new(Semaphore::new(pool_size));
        tracing::info!(pool_size, "result consumer started");

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                d = api_rx.recv() => d,
                d = agent_rx.recv() => d,
            };
            let Some(delivery) = delivery else { break };
            let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
            let consumer = self.clone();
            tokio::spawn(async move {
                consumer.handle_delivery(delivery).await;
                drop(permit);
            });
        }

        drop(api_rx);
        drop(agent_rx);
        let _ = semaphore.acquire_many(pool_size as u32).await;
        tracing::info!("result consumer stopped");
        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let queue = delivery.queue.clone();
        let response: ResponseEnvelope = match codec::decode(&delivery.body) {
            Ok(response) => response,
            Err(err) => {
                let _ = dead_letter(
                    self.broker.as_ref(),
                    Role::ResultConsumer,
                    &self.config.dead_letter.routing_key,
                    &queue,
                    &err.to_string(),
                    &delivery.body,
                    self.config.broker.publish_timeout(),
                )
                .await;
                if let Err(err) = delivery.ack().await {
                    tracing::error!(error = %err, "failed to ack dead-lettered response");
                }
                return;
            }
        };

        // unknown correlation is not retriable: the row will never appear
        match self
            .store
            .detection_execution_by_id(response.detection_execution_id)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                let _ = dead_letter(
                    self.broker.as_ref(),
                    Role::ResultConsumer,
                    &self.config.dead_letter.routing_key,
                    &queue,
                    "unknown detection execution",
                    &delivery.body,
                    self.config.broker.publish_timeout(),
                )
                .await;
                if let Err(err) = delivery.ack().await {
                    tracing::error!(error = %err, "failed to ack unknown-correlation response");
                }
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "correlation lookup failed, requeueing response");
                if let Err(err) = delivery.nack(true).await {
                    tracing::error!(error = %err, "failed to nack response");
                }
                return;
            }
        }

        match self.persist(&response).await {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    tracing::error!(error = %err, "failed to ack response");
                }
            }
            Err(err) => {
                tracing::warn!(
                    detection_execution_id = %response.detection_execution_id,
                    error = %err,
                    "response persist failed, requeueing"
                );
                if let Err(err) = delivery.nack(true).await {
                    tracing::error!(error = %err, "failed to nack response");
                }
            }
        }
    }

    /// One transaction per response: always append the result row, then
    /// CAS to the terminal state. An already-terminal row means a replayed
    /// response; the appended row stays, the status does not move.
    async fn persist(&self, response: &ResponseEnvelope) -> Result<()> {
        let terminal = match response.outcome {
            Outcome::Ok => DetectionStatus::Completed,
            Outcome::Error | Outcome::Timeout => DetectionStatus::Failed,
        };

        let tx_work = async {
            let mut tx = self.store.begin().await?;

            Store::append_detection_result(
                &mut tx,
                NewDetectionResult {
                    detection_execution_id: response.detection_execution_id,
                    detected: response.detected.as_bool(),
                    raw_response: response.raw_response.clone(),
                    parsed_results: response.parsed_results.clone(),
                    result_timestamp: response.finished_at,
                    result_source: response.source.clone(),
                    metadata: response.metadata.clone(),
                },
            )
            .await?;

            let diagnostics = (terminal == DetectionStatus::Failed
                && response.metadata.is_object())
            .then(|| response.metadata.clone());

            let transition = Store::transition_detection_execution(
                &mut tx,
                response.detection_execution_id,
                &[DetectionStatus::Pending, DetectionStatus::Running],
                terminal,
                TransitionPatch {
                    completed_at: Some(response.finished_at),
                    execution_metadata: diagnostics,
                    ..Default::default()
                },
            )
            .await;
            match transition {
                Ok(row) => {
                    tracing::info!(
                        detection_execution_id = %row.id,
                        status = %row.status,
                        source = %response.source,
                        "detection result recorded"
                    );
                }
                Err(Error::Conflict { actual, .. }) => {
                    tracing::debug!(
                        detection_execution_id = %response.detection_execution_id,
                        status = %actual,
                        "duplicate response for terminal detection execution"
                    );
                }
                Err(err) => return Err(err),
            }

            tx.commit().await?;
            Ok::<_, Error>(())
        };

        tokio::time::timeout(self.config.database.tx_timeout(), tx_work)
            .await
            .map_err(|_| Error::Transient("result transaction timed out".into()))?
    }
}
