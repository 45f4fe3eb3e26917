//! DLQ Worker - RabbitMQ consumer that dead-letters failed jobs.
//!
//! This library provides the modules for the two binaries:
//! - `dlq-worker`: consumes the primary queue until SIGINT/SIGTERM
//! - `dlq-publish`: publishes job bodies to the primary exchange
//!
//! ## Architecture
//!
//! ```text
//! publish → test.exchange → test_queue → Processor ─┬─ Success → ack
//!                                                   └─ Failure → reject(requeue = false)
//!                                                        → test.exchange.dead-letter → test_queue.dead-letter
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod processor;
pub mod topology;
pub mod worker;

// Re-export commonly used types
pub use broker::{AmqpSession, BrokerSession, Delivery, DeliveryTag, MemoryBroker, MemorySession};
pub use config::Config;
pub use consumer::{ConsumeLoop, ConsumeStats, StopReason, PREFETCH_COUNT};
pub use error::{BrokerError, TopologyError, WorkerError};
pub use processor::{Processor, SimulatedProcessor, WorkOutcome};
pub use topology::{
    declare_topology, BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, Topology,
};
