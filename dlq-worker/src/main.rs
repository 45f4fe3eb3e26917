//! DLQ Worker - consumes the primary queue and dead-letters failed jobs.
//!
//! Each job is processed by the simulated processor; successes are acked and
//! failures are rejected without requeue, which the broker routes to the
//! dead-letter queue.

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dlq::{worker, Config, SimulatedProcessor, StopReason};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        amqp_url_length = config.amqp_url.len(),
        primary_exchange = %config.primary_exchange,
        primary_queue = %config.primary_queue,
        dead_letter_exchange = %config.dead_letter_exchange,
        dead_letter_queue = %config.dead_letter_queue,
        failure_probability = config.simulate_failure_probability,
        "config_loaded"
    );

    let processor = SimulatedProcessor::from_config(&config);

    let stats = worker::run(&config, processor, shutdown_signal())
        .await
        .context("Worker stopped with an error")?;

    info!(
        received = stats.received,
        acked = stats.acked,
        dead_lettered = stats.dead_lettered,
        stopped_by = ?stats.stopped_by,
        "worker_shutdown_complete"
    );

    // Exit non-zero so a supervisor restarts the worker.
    if stats.stopped_by == StopReason::SubscriptionEnded {
        bail!("RabbitMQ ended the subscription on queue '{}'", config.primary_queue);
    }

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
