//! Error taxonomy for the worker.
//!
//! Only a failed job is handled locally (as [`WorkOutcome::Failure`]); topology
//! and broker errors stop the worker and are returned to the caller.
//!
//! [`WorkOutcome::Failure`]: crate::processor::WorkOutcome::Failure

use thiserror::Error;

/// Connection or channel level failure, or a refusal from the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// An entity already exists with different parameters.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// An exchange or queue referenced by the call does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The delivery tag was already resolved or never issued on this channel.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// The publisher confirm came back negative.
    #[error("publish to exchange '{0}' was nacked by the broker")]
    PublishNacked(String),

    /// The session was closed.
    #[error("session closed")]
    Closed,
}

/// A declaration or binding could not be established.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Rejected before any broker call was made.
    #[error("invalid topology: {0}")]
    Invalid(String),

    #[error("can not declare exchange '{name}': {source}")]
    Exchange {
        name: String,
        #[source]
        source: BrokerError,
    },

    #[error("can not declare queue '{name}': {source}")]
    Queue {
        name: String,
        #[source]
        source: BrokerError,
    },

    #[error("can not bind queue '{queue}' to exchange '{exchange}': {source}")]
    Binding {
        queue: String,
        exchange: String,
        #[source]
        source: BrokerError,
    },
}

/// Fatal error returned by the consume loop and the worker lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
