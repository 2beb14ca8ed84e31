//! Engine and worker entry points

use std::sync::Arc;

use anyhow::{bail, Result};
use purplecheck_core::config::EngineConfig;
use purplecheck_core::mq::{standard_bindings, Broker, MemoryBroker};
use purplecheck_core::store::Store;
use purplecheck_core::supervisor::Engine;
use purplecheck_core::workers::{DetectorRegistry, MockDetector, WorkerKind, WorkerRuntime};
use tokio_util::sync::CancellationToken;

/// Run the full engine until interrupted
pub async fn run_engine(config: EngineConfig, mock: bool) -> Result<()> {
    let mut builder = Engine::builder(config);
    if mock {
        builder = builder.with_detector(Arc::new(MockDetector::new("mock.api")));
    }
    let engine = builder.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received");
    engine.shutdown().await?;
    Ok(())
}

/// Run one standalone worker pool until interrupted. Uses the process-local
/// broker; pair with a network-broker backend to consume a shared queue.
pub async fn run_worker(config: EngineConfig, kind: &str, mock: bool) -> Result<()> {
    let kind = match kind {
        "api" => WorkerKind::Api,
        "agent" => WorkerKind::Agent,
        other => bail!("unknown worker kind '{other}' (expected api or agent)"),
    };

    let mut config = config;
    config.expand_env_vars();
    config.validate()?;

    let store = if config.database.url.contains(":memory:") {
        Store::connect_memory().await?
    } else {
        Store::connect(&config.database).await?
    };
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(config.dead_letter.max_redeliveries));
    broker
        .declare_topology(&standard_bindings(&config.dead_letter.routing_key))
        .await?;

    let mut registry = DetectorRegistry::new();
    if mock {
        registry.register(Arc::new(MockDetector::new("mock.api")));
    }

    let worker = Arc::new(WorkerRuntime::new(kind, store, broker, registry, config));
    tracing::info!(worker_id = %worker.worker_id(), "standalone worker starting");

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.run(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received");
    cancel.cancel();
    handle.await??;
    Ok(())
}

/// Validate the configuration and print the effective settings
pub fn check_config(config: &EngineConfig) -> Result<()> {
    config.validate()?;
    let rendered = serde_json::to_string_pretty(&serde_json::to_value(config)?)?;
    println!("{rendered}");
    Ok(())
}
