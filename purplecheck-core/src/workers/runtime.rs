//! Generic worker runtime
//!
//! Drives one typed task queue: claim the detection execution via CAS,
//! apply jitter, invoke the platform detector with a timeout, retry
//! transient failures within the row's budget, then publish exactly one
//! standardized response and ack. The worker never writes detection
//! results; it only mutates its own detection execution row.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{self, Detected, Outcome, ResponseEnvelope, TaskEnvelope};
use crate::config::{EngineConfig, Role};
use crate::mq::broker::{dead_letter, publish_with_retry};
use crate::mq::{topology, Broker, Delivery};
use crate::store::{DetectionStatus, Store, TransitionPatch};
use crate::{Error, Result};

use super::{DetectorError, DetectorRegistry};

/// Which task queue this runtime consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Api,
    Agent,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Api => "api",
            WorkerKind::Agent => "agent",
        }
    }

    pub fn task_queue(&self) -> &'static str {
        match self {
            WorkerKind::Api => topology::API_TASKS_QUEUE,
            WorkerKind::Agent => topology::AGENT_TASKS_QUEUE,
        }
    }

    pub fn response_routing_key(&self) -> &'static str {
        match self {
            WorkerKind::Api => topology::RK_API_RESPONSE,
            WorkerKind::Agent => topology::RK_AGENT_RESPONSE,
        }
    }
}

/// How one task ended up, before it becomes a response envelope
struct AttemptOutcome {
    outcome: Outcome,
    detected: Detected,
    raw_response: serde_json::Value,
    parsed_results: serde_json::Value,
    source: String,
    metadata: serde_json::Value,
}

pub struct WorkerRuntime {
    kind: WorkerKind,
    worker_id: String,
    store: Store,
    broker: Arc<dyn Broker>,
    registry: DetectorRegistry,
    config: EngineConfig,
}

impl WorkerRuntime {
    pub fn new(
        kind: WorkerKind,
        store: Store,
        broker: Arc<dyn Broker>,
        registry: DetectorRegistry,
        config: EngineConfig,
    ) -> Self {
        let worker_id = format!(
            "{}-{}",
            kind.as_str(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            kind,
            worker_id,
            store,
            broker,
            registry,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Consume the task queue until cancelled, then drain in-flight tasks
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut rx = self
            .broker
            .subscribe(
                Role::Worker,
                self.kind.task_queue(),
                self.config.broker.prefetch,
            )
            .await?;
        let pool_size = self.config.worker.pool_size;
        let semaphore = Arc::new(Semaphore::new(pool_size));
        tracing::info!(
            worker_id = %self.worker_id,
            queue = self.kind.task_queue(),
            pool_size,
            "worker runtime started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = rx.recv() => {
                    let Some(delivery) = delivery else { break };
                    let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.handle_delivery(delivery).await;
                        drop(permit);
                    });
                }
            }
        }

        drop(rx);
        let _ = semaphore.acquire_many(pool_size as u32).await;
        tracing::info!(worker_id = %self.worker_id, "worker runtime stopped");
        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let task: TaskEnvelope = match codec::decode(&delivery.body) {
            Ok(task) => task,
            Err(err) => {
                let _ = dead_letter(
                    self.broker.as_ref(),
                    Role::Worker,
                    &self.config.dead_letter.routing_key,
                    self.kind.task_queue(),
                    &err.to_string(),
                    &delivery.body,
                    self.config.broker.publish_timeout(),
                )
                .await;
                settle_ack(delivery).await;
                return;
            }
        };

        let Some(detector) = self.registry.find(task.detection_type, &task.platform) else {
            self.cancel_unsupported(&task, delivery).await;
            return;
        };

        // Claim the row. A redelivery after completion shows up as a
        // terminal conflict: skip the detector, just ack.
        match self.claim(&task).await {
            Ok(()) => {}
            Err(Error::Conflict { actual, .. }) if actual == "running" => {
                // our own redelivery after a crash mid-detection; run again
                tracing::debug!(task_id = %task.task_id, "re-claiming running task");
            }
            Err(Error::Conflict { actual, .. }) => {
                tracing::debug!(
                    task_id = %task.task_id,
                    status = %actual,
                    "task already terminal, skipping duplicate delivery"
                );
                settle_ack(delivery).await;
                return;
            }
            Err(Error::NotFound { .. }) => {
                let _ = dead_letter(
                    self.broker.as_ref(),
                    Role::Worker,
                    &self.config.dead_letter.routing_key,
                    self.kind.task_queue(),
                    "unknown detection execution",
                    &delivery.body,
                    self.config.broker.publish_timeout(),
                )
                .await;
                settle_ack(delivery).await;
                return;
            }
            Err(err) => {
                tracing::warn!(task_id = %task.task_id, error = %err, "claim failed, requeueing");
                settle_nack(delivery).await;
                return;
            }
        }

        self.jitter_sleep().await;

        let attempt = match self.attempt_with_retries(detector.as_ref(), &task).await {
            Ok(attempt) => attempt,
            Err(err) => {
                tracing::warn!(task_id = %task.task_id, error = %err, "task attempt aborted, requeueing");
                settle_nack(delivery).await;
                return;
            }
        };

        let response = ResponseEnvelope {
            task_id: task.task_id,
            detection_execution_id: task.detection_execution_id,
            outcome: attempt.outcome,
            detected: attempt.detected,
            raw_response: attempt.raw_response,
            parsed_results: attempt.parsed_results,
            source: attempt.source,
            worker_id: self.worker_id.clone(),
            finished_at: Utc::now(),
            metadata: attempt.metadata,
        };

        let body = match codec::encode(&response) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(task_id = %task.task_id, error = %err, "response encode failed");
                settle_nack(delivery).await;
                return;
            }
        };
        if let Err(err) = publish_with_retry(
            self.broker.as_ref(),
            Role::Worker,
            self.kind.response_routing_key(),
            body,
            self.config.broker.publish_timeout(),
        )
        .await
        {
            // duplicate responses from the redelivery are tolerated downstream
            tracing::warn!(task_id = %task.task_id, error = %err, "response publish failed, requeueing task");
            settle_nack(delivery).await;
            return;
        }

        settle_ack(delivery).await;
    }

    /// CAS pending -> running, stamping `started_at`
    async fn claim(&self, task: &TaskEnvelope) -> Result<()> {
        let mut tx = self.store.begin().await?;
        Store::transition_detection_execution(
            &mut tx,
            task.detection_execution_id,
            &[DetectionStatus::Pending],
            DetectionStatus::Running,
            TransitionPatch {
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// No registered detector handles the task: cancel the row and ack.
    /// No response is published; cancellation is visible in the store.
    async fn cancel_unsupported(&self, task: &TaskEnvelope, delivery: Delivery) {
        tracing::warn!(
            task_id = %task.task_id,
            detection_type = %task.detection_type,
            platform = %task.platform,
            "no detector supports task, cancelling"
        );
        let cancel = async {
            let mut tx = self.store.begin().await?;
            Store::transition_detection_execution(
                &mut tx,
                task.detection_execution_id,
                &[DetectionStatus::Pending],
                DetectionStatus::Cancelled,
                TransitionPatch {
                    completed_at: Some(Utc::now()),
                    execution_metadata: Some(serde_json::json!({
                        "error": format!(
                            "no detector supports {}/{}",
                            task.detection_type, task.platform
                        ),
                    })),
                    ..Default::default()
                },
            )
            .await?;
            tx.commit().await?;
            Ok::<_, Error>(())
        };

        match cancel.await {
            Ok(()) | Err(Error::Conflict { .. }) => settle_ack(delivery).await,
            Err(Error::NotFound { .. }) => settle_ack(delivery).await,
            Err(err) => {
                tracing::warn!(task_id = %task.task_id, error = %err, "cancel failed, requeueing");
                settle_nack(delivery).await;
            }
        }
    }

    /// Uniform random delay before hitting the detection back-end, so a
    /// burst of executions does not stampede it.
    async fn jitter_sleep(&self) {
        let (min, max) = (
            self.config.worker.jitter_min_secs,
            self.config.worker.jitter_max_secs,
        );
        let jitter = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        if jitter > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(jitter)).await;
        }
    }

    /// Detector invocation with timeout and in-process transient retry.
    /// Every transient failure bumps the row's `retry_count`; once the
    /// budget is spent the task fails with `error` or `timeout`.
    async fn attempt_with_retries(
        &self,
        detector: &dyn super::Detector,
        task: &TaskEnvelope,
    ) -> Result<AttemptOutcome> {
        let timeout = self.config.worker.detector_timeout();
        loop {
            let (failure, timed_out) =
                match tokio::time::timeout(timeout, detector.detect(task)).await {
                    Ok(Ok(detection)) => {
                        return Ok(AttemptOutcome {
                            outcome: Outcome::Ok,
                            detected: detection.detected,
                            raw_response: detection.raw_response,
                            parsed_results: detection.parsed_results,
                            source: detection.source,
                            metadata: serde_json::json!({}),
                        });
                    }
                    Ok(Err(DetectorError::Permanent(message))) => {
                        tracing::warn!(task_id = %task.task_id, %message, "permanent detector failure");
                        return Ok(AttemptOutcome {
                            outcome: Outcome::Error,
                            detected: Detected::Unknown,
                            raw_response: serde_json::Value::Null,
                            parsed_results: serde_json::Value::Null,
                            source: detector.name().to_string(),
                            metadata: serde_json::json!({ "error": message }),
                        });
                    }
                    Ok(Err(DetectorError::Transient(message))) => (message, false),
                    Err(_) => (
                        format!("detector call exceeded {}s", timeout.as_secs_f64()),
                        true,
                    ),
                };

            let mut tx = self.store.begin().await?;
            match Store::increment_retry_count(&mut tx, task.detection_execution_id).await {
                Ok(count) => {
                    tx.commit().await?;
                    tracing::warn!(
                        task_id = %task.task_id,
                        retry_count = count,
                        max_retries = task.max_retries,
                        failure = %failure,
                        "transient detector failure, retrying"
                    );
                    tokio::time::sleep(self.config.worker.retry_delay()).await;
                }
                Err(Error::Constraint(_)) => {
                    tx.commit().await?;
                    tracing::warn!(
                        task_id = %task.task_id,
                        failure = %failure,
                        "retry budget exhausted"
                    );
                    return Ok(AttemptOutcome {
                        outcome: if timed_out {
                            Outcome::Timeout
                        } else {
                            Outcome::Error
                        },
                        detected: Detected::Unknown,
                        raw_response: serde_json::Value::Null,
                        parsed_results: serde_json::Value::Null,
                        source: detector.name().to_string(),
                        metadata: serde_json::json!({
                            "error": failure,
                            "retries_exhausted": true,
                        }),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn settle_ack(delivery: Delivery) {
    if let Err(err) = delivery.ack().await {
        tracing::error!(error = %err, "failed to ack delivery");
    }
}

async fn settle_nack(delivery: Delivery) {
    if let Err(err) = delivery.nack(true).await {
        tracing::error!(error = %err, "failed to nack delivery");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::mq::{standard_bindings, MemoryBroker};
    use crate::store::{DetectionType, NewDetectionExecution, NewExecution};
    use crate::workers::MockDetector;

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.worker.jitter_min_secs = 0.0;
        config.worker.jitter_max_secs = 0.0;
        config.worker.retry_delay_secs = 0.01;
        config.worker.detector_timeout_secs = 1.0;
        config
    }

    async fn seeded(store: &Store, max_retries: u32) -> TaskEnvelope {
        let op_external = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        Store::upsert_operation(
            &mut tx,
            op_external,
            "op",
            Utc::now(),
            &serde_json::json!({}),
            Utc::now(),
        )
        .await
        .unwrap();
        let (execution, _) = Store::create_execution_if_absent(
            &mut tx,
            NewExecution {
                operation_external_id: op_external,
                agent_host: "h".into(),
                agent_paw: "p".into(),
                link_id: Uuid::new_v4(),
                command: "whoami".into(),
                pid: 1,
                status: 0,
                result_data: serde_json::json!({}),
                agent_reported_at: Utc::now(),
                link_state: "SUCCESS".into(),
                raw_message: serde_json::Value::Null,
            },
        )
        .await
        .unwrap();
        let detection = Store::create_detection_execution(
            &mut tx,
            NewDetectionExecution {
                execution_id: execution.id,
                operation_external_id: op_external,
                detection_type: DetectionType::Api,
                detection_platform: "siem".into(),
                detection_config: serde_json::json!({"query": "q"}),
                max_retries,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        TaskEnvelope {
            task_id: Uuid::new_v4(),
            detection_execution_id: detection.id,
            execution_id: execution.id,
            operation_id: op_external,
            detection_type: DetectionType::Api,
            platform: "siem".into(),
            config: detection.detection_config,
            max_retries,
            enqueued_at: Utc::now(),
        }
    }

    async fn run_one_task(
        broker: &Arc<MemoryBroker>,
        runtime: Arc<WorkerRuntime>,
        task: &TaskEnvelope,
    ) -> Option<ResponseEnvelope> {
        let mut responses = broker
            .subscribe(Role::ResultConsumer, topology::API_RESPONSES_QUEUE, 1)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(cancel.clone()));

        broker
            .publish(
                Role::Dispatcher,
                topology::RK_API_TASK,
                codec::encode(task).unwrap(),
            )
            .await
            .unwrap();

        let response = tokio::time::timeout(std::time::Duration::from_secs(2), responses.recv())
            .await
            .ok()
            .flatten();
        let decoded = match &response {
            Some(delivery) => Some(codec::decode::<ResponseEnvelope>(&delivery.body).unwrap()),
            None => None,
        };
        cancel.cancel();
        let _ = handle.await;
        decoded
    }

    #[test]
    fn test_worker_kind_wiring() {
        assert_eq!(WorkerKind::Api.task_queue(), topology::API_TASKS_QUEUE);
        assert_eq!(WorkerKind::Agent.task_queue(), topology::AGENT_TASKS_QUEUE);
        assert_eq!(
            WorkerKind::Api.response_routing_key(),
            topology::RK_API_RESPONSE
        );
        assert_eq!(
            WorkerKind::Agent.response_routing_key(),
            topology::RK_AGENT_RESPONSE
        );
    }

    #[tokio::test]
    async fn test_happy_path_publishes_ok_response() {
        let store = Store::connect_memory().await.unwrap();
        let broker = Arc::new(MemoryBroker::new(3));
        broker
            .declare_topology(&standard_bindings("checking.dead.letter"))
            .await
            .unwrap();
        let task = seeded(&store, 3).await;

        let registry = DetectorRegistry::new().with(Arc::new(MockDetector::new("siem.test")));
        let runtime = Arc::new(WorkerRuntime::new(
            WorkerKind::Api,
            store.clone(),
            broker.clone(),
            registry,
            fast_config(),
        ));

        let response = run_one_task(&broker, runtime, &task).await.unwrap();
        assert_eq!(response.outcome, Outcome::Ok);
        assert_eq!(response.detected, Detected::Yes);
        assert_eq!(response.source, "siem.test");
        assert_eq!(response.detection_execution_id, task.detection_execution_id);

        let row = store
            .detection_execution_by_id(task.detection_execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DetectionStatus::Running);
        assert_eq!(row.retry_count, 0);
        assert!(row.started_at.is_some());

        // task message settled
        assert_eq!(broker.queue_stats(topology::API_TASKS_QUEUE), Some((0, 0)));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success_counts_retries() {
        let store = Store::connect_memory().await.unwrap();
        let broker = Arc::new(MemoryBroker::new(3));
        broker
            .declare_topology(&standard_bindings("checking.dead.letter"))
            .await
            .unwrap();
        let task = seeded(&store, 2).await;

        let registry = DetectorRegistry::new().with(Arc::new(
            MockDetector::new("siem.test").failing_transiently(2),
        ));
        let runtime = Arc::new(WorkerRuntime::new(
            WorkerKind::Api,
            store.clone(),
            broker.clone(),
            registry,
            fast_config(),
        ));

        let response = run_one_task(&broker, runtime, &task).await.unwrap();
        assert_eq!(response.outcome, Outcome::Ok);

        let row = store
            .detection_execution_by_id(task.detection_execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.retry_count, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_publish_error_response() {
        let store = Store::connect_memory().await.unwrap();
        let broker = Arc::new(MemoryBroker::new(3));
        broker
            .declare_topology(&standard_bindings("checking.dead.letter"))
            .await
            .unwrap();
        let task = seeded(&store, 2).await;

        let registry = DetectorRegistry::new().with(Arc::new(
            MockDetector::new("siem.test").failing_transiently(10),
        ));
        let runtime = Arc::new(WorkerRuntime::new(
            WorkerKind::Api,
            store.clone(),
            broker.clone(),
            registry,
            fast_config(),
        ));

        let response = run_one_task(&broker, runtime, &task).await.unwrap();
        assert_eq!(response.outcome, Outcome::Error);
        assert_eq!(response.detected, Detected::Unknown);
        assert_eq!(response.metadata["retries_exhausted"], true);

        let row = store
            .detection_execution_by_id(task.detection_execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.retry_count, 2);
    }

    #[tokio::test]
    async fn test_unsupported_platform_cancels_without_response() {
        let store = Store::connect_memory().await.unwrap();
        let broker = Arc::new(MemoryBroker::new(3));
        broker
            .declare_topology(&standard_bindings("checking.dead.letter"))
            .await
            .unwrap();
        let task = seeded(&store, 3).await;

        // registry only knows a different platform
        let registry = DetectorRegistry::new().with(Arc::new(
            MockDetector::new("edr.mock").supporting(DetectionType::Api, "edr"),
        ));
        let runtime = Arc::new(WorkerRuntime::new(
            WorkerKind::Api,
            store.clone(),
            broker.clone(),
            registry,
            fast_config(),
        ));

        let response = run_one_task(&broker, runtime, &task).await;
        assert!(response.is_none());

        let row = store
            .detection_execution_by_id(task.detection_execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, DetectionStatus::Cancelled);
        assert!(row.completed_at.is_some());
        assert_eq!(broker.queue_stats(topology::API_TASKS_QUEUE), Some((0, 0)));
    }

    #[tokio::test]
    async fn test_terminal_row_skips_duplicate_delivery() {
        let store = Store::connect_memory().await.unwrap();
        let broker = Arc::new(MemoryBroker::new(3));
        broker
            .declare_topology(&standard_bindings("checking.dead.letter"))
            .await
            .unwrap();
        let task = seeded(&store, 3).await;

        // simulate a completed run from a previous delivery
        let mut tx = store.begin().await.unwrap();
        Store::transition_detection_execution(
            &mut tx,
            task.detection_execution_id,
            &[DetectionStatus::Pending],
            DetectionStatus::Completed,
            TransitionPatch {
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let registry = DetectorRegistry::new().with(Arc::new(MockDetector::new("siem.test")));
        let runtime = Arc::new(WorkerRuntime::new(
            WorkerKind::Api,
            store.clone(),
            broker.clone(),
            registry,
            fast_config(),
        ));

        // no response: the duplicate is acked without re-running the detector
        let response = run_one_task(&broker, runtime, &task).await;
        assert!(response.is_none());
        assert_eq!(broker.queue_stats(topology::API_TASKS_QUEUE), Some((0, 0)));
    }
}
