//! Lifecycle supervisor
//!
//! The explicit root object: builds store, broker, consumers and workers,
//! starts them in dependency order, and coordinates graceful shutdown.
//! Nothing in the engine lives in process-wide state; everything hangs off
//! the `Engine` built here.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, Role};
use crate::ingest::IngestionConsumer;
use crate::mq::{standard_bindings, Broker, MemoryBroker};
use crate::results::ResultConsumer;
use crate::store::Store;
use crate::workers::{Detector, DetectorRegistry, WorkerKind, WorkerRuntime};
use crate::Result;

/// Builder for a running engine. Store, broker and detectors are
/// injectable; defaults are the configured database and the in-process
/// broker.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Store>,
    broker: Option<Arc<dyn Broker>>,
    registry: DetectorRegistry,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            broker: None,
            registry: DetectorRegistry::new(),
        }
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.registry.register(detector);
        self
    }

    pub fn with_registry(mut self, registry: DetectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Validate configuration, connect the store and broker, declare the
    /// topology, and start consumers and workers in dependency order.
    pub async fn start(self) -> Result<Engine> {
        let mut config = self.config;
        config.expand_env_vars();
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None if config.database.url.contains(":memory:") => Store::connect_memory().await?,
            None => Store::connect(&config.database).await?,
        };

        let broker: Arc<dyn Broker> = match self.broker {
            Some(broker) => broker,
            None => Arc::new(MemoryBroker::new(config.dead_letter.max_redeliveries)),
        };
        broker
            .declare_topology(&standard_bindings(&config.dead_letter.routing_key))
            .await?;

        for role in [
            Role::Ingestion,
            Role::Dispatcher,
            Role::Worker,
            Role::ResultConsumer,
        ] {
            tracing::info!(
                role = role.as_str(),
                user = %config.broker.credentials(role).user,
                vhost = %config.broker.vhost,
                "broker role configured"
            );
        }

        if self.registry.is_empty() {
            tracing::warn!("no detectors registered; every task will be cancelled as unsupported");
        }

        let cancel = CancellationToken::new();
        let mut handles: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

        let results = Arc::new(ResultConsumer::new(
            store.clone(),
            broker.clone(),
            config.clone(),
        ));
        handles.push(("result-consumer", tokio::spawn(results.run(cancel.clone()))));

        let ingestion = Arc::new(IngestionConsumer::new(
            store.clone(),
            broker.clone(),
            config.clone(),
        ));
        handles.push(("ingestion-consumer", tokio::spawn(ingestion.run(cancel.clone()))));

        for kind in [WorkerKind::Api, WorkerKind::Agent] {
            let worker = Arc::new(WorkerRuntime::new(
                kind,
                store.clone(),
                broker.clone(),
                self.registry.clone(),
                config.clone(),
            ));
            let name = match kind {
                WorkerKind::Api => "api-worker",
                WorkerKind::Agent => "agent-worker",
            };
            tracing::info!(worker_id = %worker.worker_id(), "starting {name}");
            handles.push((name, tokio::spawn(worker.run(cancel.clone()))));
        }

        tracing::info!("engine started");
        Ok(Engine {
            config,
            store,
            broker,
            cancel,
            handles,
        })
    }
}

/// A running engine; dropping it without `shutdown` leaves tasks detached
pub struct Engine {
    config: EngineConfig,
    store: Store,
    broker: Arc<dyn Broker>,
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop accepting deliveries, drain in-flight work for up to the grace
    /// period, then close broker and database. Messages still unacked after
    /// the grace period are redelivered on the next start.
    pub async fn shutdown(mut self) -> Result<()> {
        tracing::info!("engine shutting down");
        self.cancel.cancel();

        let grace = self.config.supervisor.shutdown_grace();
        for (name, mut handle) in self.handles.drain(..).rev() {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(Ok(()))) => tracing::debug!(component = name, "stopped"),
                Ok(Ok(Err(err))) => {
                    tracing::warn!(component = name, error = %err, "stopped with error");
                }
                Ok(Err(join_err)) => {
                    tracing::warn!(component = name, error = %join_err, "task join failed");
                }
                Err(_) => {
                    tracing::warn!(
                        component = name,
                        grace_secs = grace.as_secs_f64(),
                        "grace period expired, abandoning in-flight work"
                    );
                    handle.abort();
                }
            }
        }

        self.broker.close().await;
        self.store.close().await;
        tracing::info!("engine stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        config.worker.jitter_min_secs = 0.0;
        config.worker.jitter_max_secs = 0.0;
        config.supervisor.shutdown_grace_secs = 2.0;
        config
    }

    #[tokio::test]
    async fn test_engine_starts_and_stops() {
        let engine = Engine::builder(test_config()).start().await.unwrap();
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_config() {
        let mut config = test_config();
        config.broker.ack_deadline_secs = 1.0;
        let result = Engine::builder(config).start().await;
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }
}
