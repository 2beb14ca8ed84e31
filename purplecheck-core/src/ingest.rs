//! Ingestion consumer for upstream execution records
//!
//! Consumes the instructions queue, persists operation + execution + planned
//! detection rows in one transaction, then hands the new rows to the
//! dispatcher. The instruction message is acked only after every task
//! publish succeeded; anything short of that nacks and lets the broker
//! redeliver into the idempotent replay path.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, ExecutionRecord};
use crate::config::{EngineConfig, Role};
use crate::dispatch::TaskDispatcher;
use crate::mq::broker::dead_letter;
use crate::mq::{topology, Broker, Delivery};
use crate::planner;
use crate::store::{DetectionExecutionRow, ExecutionRow, NewDetectionExecution, NewExecution, Store};
use crate::{Error, Result};

/// What one ingested record produced and still needs dispatching
struct Ingested {
    execution: ExecutionRow,
    new_detections: Vec<DetectionExecutionRow>,
}

pub struct IngestionConsumer {
    store: Store,
    broker: Arc<dyn Broker>,
    dispatcher: TaskDispatcher,
    config: EngineConfig,
}

impl IngestionConsumer {
    pub fn new(store: Store, broker: Arc<dyn Broker>, config: EngineConfig) -> Self {
        let dispatcher = TaskDispatcher::new(broker.clone(), config.broker.publish_timeout());
        Self {
            store,
            broker,
            dispatcher,
            config,
        }
    }

    /// Consume until cancelled, handling up to `pool_size` deliveries
    /// concurrently, then drain in-flight handlers.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut rx = self
            .broker
            .subscribe(
                Role::Ingestion,
                topology::INSTRUCTIONS_QUEUE,
                self.config.broker.prefetch,
            )
            .await?;
        let pool_size = self.config.worker.pool_size;
        let semaphore = Arc::new(Semaphore::new(pool_size));
        tracing::info!(pool_size, "ingestion consumer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = rx.recv() => {
                    let Some(delivery) = delivery else { break };
                    let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                    let consumer = self.clone();
                    tokio::spawn(async move {
                        consumer.handle_delivery(delivery).await;
                        drop(permit);
                    });
                }
            }
        }

        drop(rx); // stop accepting new deliveries
        let _ = semaphore.acquire_many(pool_size as u32).await;
        tracing::info!("ingestion consumer stopped");
        Ok(())
    }

    /// Top-level handler: classifies every failure into ack, nack+requeue,
    /// or dead-letter. Nothing escapes the consumer loop.
    async fn handle_delivery(&self, delivery: Delivery) {
        let record: ExecutionRecord = match codec::decode(&delivery.body) {
            Ok(record) => record,
            Err(err) => {
                let _ = dead_letter(
                    self.broker.as_ref(),
                    Role::Ingestion,
                    &self.config.dead_letter.routing_key,
                    topology::INSTRUCTIONS_QUEUE,
                    &err.to_string(),
                    &delivery.body,
                    self.config.broker.publish_timeout(),
                )
                .await;
                if let Err(err) = delivery.ack().await {
                    tracing::error!(error = %err, "failed to ack dead-lettered instruction");
                }
                return;
            }
        };

        let link_id = record.execution.link_id;
        let ingested = match self.persist(record).await {
            Ok(ingested) => ingested,
            Err(err) => {
                tracing::warn!(%link_id, error = %err, "instruction persist failed, requeueing");
                if let Err(err) = delivery.nack(true).await {
                    tracing::error!(error = %err, "failed to nack instruction");
                }
                return;
            }
        };

        for detection in &ingested.new_detections {
            if let Err(err) = self.dispatcher.dispatch(detection, &ingested.execution).await {
                tracing::warn!(
                    %link_id,
                    detection_execution_id = %detection.id,
                    error = %err,
                    "task dispatch failed, requeueing instruction"
                );
                if let Err(err) = delivery.nack(true).await {
                    tracing::error!(error = %err, "failed to nack instruction");
                }
                return;
            }
        }

        if let Err(err) = delivery.ack().await {
            tracing::error!(%link_id, error = %err, "failed to ack instruction");
        }
    }

    /// One transaction per record: upsert operation, create execution if
    /// absent, plan, insert pending detection rows. A duplicate `link_id`
    /// plans nothing new and returns whatever is still pending dispatch.
    async fn persist(&self, record: ExecutionRecord) -> Result<Ingested> {
        let tx_work = async {
            let mut tx = self.store.begin().await?;

            let operation = Store::upsert_operation(
                &mut tx,
                record.operation.id,
                &record.operation.name,
                record.operation.started_at,
                &serde_json::json!({}),
                record.execution.agent_reported_at,
            )
            .await?;

            let report = &record.execution;
            let (execution, created) = Store::create_execution_if_absent(
                &mut tx,
                NewExecution {
                    operation_external_id: operation.external_id,
                    agent_host: report.agent_host.clone(),
                    agent_paw: report.agent_paw.clone(),
                    link_id: report.link_id,
                    command: report.command.clone(),
                    pid: report.pid,
                    status: report.status,
                    result_data: serde_json::to_value(&report.result_data)?,
                    agent_reported_at: report.agent_reported_at,
                    link_state: report.link_state.clone(),
                    raw_message: record.raw_message.clone(),
                },
            )
            .await?;

            let mut new_detections = Vec::new();
            if created {
                for planned in planner::plan(&record, self.config.worker.max_retries) {
                    let row = Store::create_detection_execution(
                        &mut tx,
                        NewDetectionExecution {
                            execution_id: execution.id,
                            operation_external_id: operation.external_id,
                            detection_type: planned.detection_type,
                            detection_platform: planned.detection_platform,
                            detection_config: planned.detection_config,
                            max_retries: planned.max_retries,
                        },
                    )
                    .await?;
                    new_detections.push(row);
                }
                tracing::info!(
                    link_id = %execution.link_id,
                    operation = %operation.name,
                    detections = new_detections.len(),
                    "ingested execution record"
                );
            } else {
                // Replay path. Rows still pending were planned by an earlier
                // delivery whose task publish never got acked; re-issue them.
                // Workers and the result consumer absorb any double dispatch.
                new_detections =
                    Store::pending_detections_for_execution(&mut tx, execution.id).await?;
                tracing::debug!(
                    link_id = %execution.link_id,
                    pending = new_detections.len(),
                    "duplicate execution record, idempotent replay"
                );
            }

            tx.commit().await?;
            Ok::<_, Error>(Ingested {
                execution,
                new_detections,
            })
        };

        tokio::time::timeout(self.config.database.tx_timeout(), tx_work)
            .await
            .map_err(|_| Error::Transient("ingestion transaction timed out".into()))?
    }
}
