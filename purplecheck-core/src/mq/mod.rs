//! Broker access: contract, topology, and the in-process implementation

pub mod broker;
pub mod memory;
pub mod topology;

pub use broker::{publish_with_retry, Broker, Delivery, DeliveryAck};
pub use memory::MemoryBroker;
pub use topology::{standard_bindings, topic_matches, QueueBinding};
