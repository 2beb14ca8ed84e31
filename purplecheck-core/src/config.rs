//! Configuration types for the checking engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Broker roles with distinct credentials and permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publisher,
    Ingestion,
    Dispatcher,
    Worker,
    ResultConsumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Ingestion => "ingestion",
            Role::Dispatcher => "dispatcher",
            Role::Worker => "worker",
            Role::ResultConsumer => "result_consumer",
        }
    }
}

/// Credentials for one broker role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleCredentials {
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

impl RoleCredentials {
    fn named(user: &str) -> Self {
        Self {
            user: user.to_string(),
            pass: String::new(),
        }
    }
}

/// Per-role credential table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRoles {
    #[serde(default = "default_publisher_credentials")]
    pub publisher: RoleCredentials,
    #[serde(default = "default_ingestion_credentials")]
    pub ingestion: RoleCredentials,
    #[serde(default = "default_dispatcher_credentials")]
    pub dispatcher: RoleCredentials,
    #[serde(default = "default_worker_credentials")]
    pub worker: RoleCredentials,
    #[serde(default = "default_result_consumer_credentials")]
    pub result_consumer: RoleCredentials,
}

fn default_publisher_credentials() -> RoleCredentials {
    RoleCredentials::named("checking_publisher")
}
fn default_ingestion_credentials() -> RoleCredentials {
    RoleCredentials::named("checking_ingestion")
}
fn default_dispatcher_credentials() -> RoleCredentials {
    RoleCredentials::named("checking_dispatcher")
}
fn default_worker_credentials() -> RoleCredentials {
    RoleCredentials::named("checking_worker")
}
fn default_result_consumer_credentials() -> RoleCredentials {
    RoleCredentials::named("checking_result_consumer")
}

impl Default for BrokerRoles {
    fn default() -> Self {
        Self {
            publisher: default_publisher_credentials(),
            ingestion: default_ingestion_credentials(),
            dispatcher: default_dispatcher_credentials(),
            worker: default_worker_credentials(),
            result_consumer: default_result_consumer_credentials(),
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Per-consumer in-flight window
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Broker-enforced ack deadline; checked against the worker budget at startup
    #[serde(default = "default_ack_deadline")]
    pub ack_deadline_secs: f64,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: f64,
    #[serde(default)]
    pub roles: BrokerRoles,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}
fn default_broker_port() -> u16 {
    5672
}
fn default_vhost() -> String {
    "/purplecheck".to_string()
}
fn default_prefetch() -> usize {
    16
}
fn default_ack_deadline() -> f64 {
    600.0
}
fn default_publish_timeout() -> f64 {
    5.0
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            vhost: default_vhost(),
            prefetch: default_prefetch(),
            ack_deadline_secs: default_ack_deadline(),
            publish_timeout_secs: default_publish_timeout(),
            roles: BrokerRoles::default(),
        }
    }
}

impl BrokerConfig {
    pub fn credentials(&self, role: Role) -> &RoleCredentials {
        match role {
            Role::Publisher => &self.roles.publisher,
            Role::Ingestion => &self.roles.ingestion,
            Role::Dispatcher => &self.roles.dispatcher,
            Role::Worker => &self.roles.worker,
            Role::ResultConsumer => &self.roles.result_consumer,
        }
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.ack_deadline_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.publish_timeout_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_min")]
    pub pool_min: u32,
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,
    #[serde(default = "default_tx_timeout")]
    pub tx_timeout_secs: f64,
}

fn default_database_url() -> String {
    "sqlite://purplecheck.db".to_string()
}
fn default_pool_min() -> u32 {
    1
}
fn default_pool_max() -> u32 {
    8
}
fn default_tx_timeout() -> f64 {
    10.0
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            tx_timeout_secs: default_tx_timeout(),
        }
    }
}

impl DatabaseConfig {
    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tx_timeout_secs)
    }
}

/// Worker runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_jitter_min")]
    pub jitter_min_secs: f64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max_secs: f64,
    /// Default retry budget for tasks whose config does not carry one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: f64,
    #[serde(default = "default_detector_timeout")]
    pub detector_timeout_secs: f64,
    /// Handler pool size per consumer
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_jitter_min() -> f64 {
    0.1
}
fn default_jitter_max() -> f64 {
    0.5
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    3.0
}
fn default_detector_timeout() -> f64 {
    30.0
}
fn default_pool_size() -> usize {
    16
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            jitter_min_secs: default_jitter_min(),
            jitter_max_secs: default_jitter_max(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            detector_timeout_secs: default_detector_timeout(),
            pool_size: default_pool_size(),
        }
    }
}

impl WorkerConfig {
    pub fn jitter_min(&self) -> Duration {
        Duration::from_secs_f64(self.jitter_min_secs)
    }

    pub fn jitter_max(&self) -> Duration {
        Duration::from_secs_f64(self.jitter_max_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.detector_timeout_secs)
    }

    /// Worst-case unacked window: jitter plus every retry attempt
    pub fn ack_budget_secs(&self) -> f64 {
        self.jitter_max_secs
            + f64::from(self.max_retries) * (self.detector_timeout_secs + self.retry_delay_secs)
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: f64,
}

fn default_shutdown_grace() -> f64 {
    30.0
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_secs)
    }
}

/// Dead-letter routing for rejected messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    #[serde(default = "default_dead_letter_routing_key")]
    pub routing_key: String,
    /// Redeliveries tolerated before a message is treated as poison
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

fn default_dead_letter_routing_key() -> String {
    "checking.dead.letter".to_string()
}
fn default_max_redeliveries() -> u32 {
    5
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            routing_key: default_dead_letter_routing_key(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from default locations with cascade:
    /// 1. ./purplecheck.toml (local override)
    /// 2. ~/.purplecheck/config.toml (global defaults)
    /// 3. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(config) = Self::from_file("purplecheck.toml") {
            return config;
        }

        if let Some(home) = dirs::home_dir() {
            let global_path = home.join(".purplecheck").join("config.toml");
            if let Ok(config) = Self::from_file(&global_path) {
                return config;
            }
        }

        Self::default()
    }

    /// Get the path to the global config file
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".purplecheck").join("config.toml"))
    }

    /// Expand `${VAR}` environment references in credential fields
    pub fn expand_env_vars(&mut self) {
        for creds in [
            &mut self.broker.roles.publisher,
            &mut self.broker.roles.ingestion,
            &mut self.broker.roles.dispatcher,
            &mut self.broker.roles.worker,
            &mut self.broker.roles.result_consumer,
        ] {
            creds.pass = expand_env(&creds.pass);
        }
        self.database.url = expand_env(&self.database.url);
    }

    /// Check cross-field invariants. Run once at startup before anything
    /// connects; a bad ack-deadline policy must fail fast, not at first
    /// redelivery.
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker.jitter_min_secs > self.worker.jitter_max_secs {
            return Err(crate::Error::Config(format!(
                "jitter_min_secs ({}) exceeds jitter_max_secs ({})",
                self.worker.jitter_min_secs, self.worker.jitter_max_secs
            )));
        }
        if self.database.pool_min > self.database.pool_max {
            return Err(crate::Error::Config(format!(
                "pool_min ({}) exceeds pool_max ({})",
                self.database.pool_min, self.database.pool_max
            )));
        }
        if self.broker.prefetch == 0 {
            return Err(crate::Error::Config("prefetch must be positive".into()));
        }
        if self.worker.pool_size == 0 {
            return Err(crate::Error::Config("pool_size must be positive".into()));
        }
        let budget = self.worker.ack_budget_secs();
        if self.broker.ack_deadline_secs <= budget {
            return Err(crate::Error::Config(format!(
                "ack_deadline_secs ({}) must exceed the worker retry budget \
                 (jitter_max + max_retries x (detector_timeout + retry_delay) = {budget}s)",
                self.broker.ack_deadline_secs
            )));
        }
        Ok(())
    }
}

fn expand_env(value: &str) -> String {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        if let Ok(resolved) = std::env::var(var_name) {
            return resolved;
        }
    }
    value.to_string()
}
