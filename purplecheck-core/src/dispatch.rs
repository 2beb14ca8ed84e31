//! Task dispatcher
//!
//! Builds one task envelope per pending detection execution and forwards it
//! to the matching worker queue. Fire-and-forward: the dispatcher never
//! waits for a worker response; correlation happens through the IDs the
//! envelope carries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::codec::{self, TaskEnvelope};
use crate::config::Role;
use crate::mq::{broker::publish_with_retry, topology, Broker};
use crate::store::{DetectionExecutionRow, DetectionType, ExecutionRow};
use crate::Result;

/// Routing key for a detection type: api tasks and agent tasks ride
/// different queues.
pub fn routing_key_for(detection_type: DetectionType) -> &'static str {
    if detection_type.is_agent() {
        topology::RK_AGENT_TASK
    } else {
        topology::RK_API_TASK
    }
}

pub struct TaskDispatcher {
    broker: Arc<dyn Broker>,
    publish_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(broker: Arc<dyn Broker>, publish_timeout: Duration) -> Self {
        Self {
            broker,
            publish_timeout,
        }
    }

    /// Publish one detection execution to its worker queue. The row must
    /// already be committed `pending`; a publish failure propagates so the
    /// enclosing instruction message is nacked and redelivered.
    pub async fn dispatch(
        &self,
        detection: &DetectionExecutionRow,
        execution: &ExecutionRow,
    ) -> Result<TaskEnvelope> {
        let envelope = TaskEnvelope {
            task_id: Uuid::new_v4(),
            detection_execution_id: detection.id,
            execution_id: execution.id,
            operation_id: detection.operation_external_id,
            detection_type: detection.detection_type,
            platform: detection.detection_platform.clone(),
            config: detection.detection_config.clone(),
            max_retries: detection.max_retries,
            enqueued_at: Utc::now(),
        };

        let routing_key = routing_key_for(detection.detection_type);
        let body = codec::encode(&envelope)?;
        publish_with_retry(
            self.broker.as_ref(),
            Role::Dispatcher,
            routing_key,
            body,
            self.publish_timeout,
        )
        .await?;

        tracing::debug!(
            detection_execution_id = %detection.id,
            detection_type = %detection.detection_type,
            platform = %detection.detection_platform,
            routing_key,
            "dispatched detection task"
        );
        Ok(envelope)
    }
}
