//! Worker lifecycle: connect, declare topology, consume, release.

use std::future::Future;

use tracing::{info, warn};

use crate::broker::{AmqpSession, BrokerSession};
use crate::config::Config;
use crate::consumer::{ConsumeLoop, ConsumeStats};
use crate::error::WorkerError;
use crate::processor::Processor;
use crate::topology::{declare_topology, Topology};

/// Connect to RabbitMQ and run the worker until `shutdown` completes or the
/// subscription ends.
///
/// The session is closed on every exit path, including a failed topology
/// declaration.
pub async fn run<P, F>(config: &Config, processor: P, shutdown: F) -> Result<ConsumeStats, WorkerError>
where
    P: Processor,
    F: Future<Output = ()>,
{
    let topology = config.topology()?;
    let session = AmqpSession::connect(&config.amqp_url).await?;

    run_on(&session, &topology, &config.consumer_tag, processor, shutdown).await
}

/// Run the worker on an already open session, then close it.
///
/// The session is closed whether `serve` succeeds or fails. A close error is
/// logged and never replaces the result of `serve`.
pub async fn run_on<S, P, F>(
    session: &S,
    topology: &Topology,
    consumer_tag: &str,
    processor: P,
    shutdown: F,
) -> Result<ConsumeStats, WorkerError>
where
    S: BrokerSession + ?Sized,
    P: Processor,
    F: Future<Output = ()>,
{
    let result = serve(session, topology, consumer_tag, processor, shutdown).await;

    if let Err(e) = session.close().await {
        warn!(error = %e, "worker_session_close_failed");
    }

    result
}

/// Declare `topology` on an open session, then consume its primary queue.
pub async fn serve<S, P, F>(
    session: &S,
    topology: &Topology,
    consumer_tag: &str,
    processor: P,
    shutdown: F,
) -> Result<ConsumeStats, WorkerError>
where
    S: BrokerSession + ?Sized,
    P: Processor,
    F: Future<Output = ()>,
{
    declare_topology(session, topology).await?;
    info!(
        primary_queue = %topology.primary_queue.name,
        dead_letter_queue = %topology.dead_letter_queue.name,
        "topology_ready"
    );

    ConsumeLoop::new(session, processor, &topology.primary_queue.name, consumer_tag)
        .run(shutdown)
        .await
}
