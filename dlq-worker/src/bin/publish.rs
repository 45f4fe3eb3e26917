//! DLQ Publish - sends job bodies to the primary exchange.
//!
//! Each command-line argument is published as one message body; with no
//! arguments a single `{"id":1}` job is sent. The topology is declared first
//! so the message is not dropped when the worker has never run.
//!
//! ```text
//! dlq-publish '{"id":1}' '{"id":2}'
//! ```

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dlq::{declare_topology, AmqpSession, BrokerSession, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let mut bodies: Vec<String> = std::env::args().skip(1).collect();
    if bodies.is_empty() {
        bodies.push(r#"{"id":1}"#.to_string());
    }

    let config = Config::from_env();
    let topology = config.topology().context("Invalid topology configuration")?;

    let session = AmqpSession::connect(&config.amqp_url)
        .await
        .context("Failed to connect to RabbitMQ")?;

    let result = publish_all(&session, &config, &topology, &bodies).await;

    if let Err(e) = session.close().await {
        warn!(error = %e, "publisher_session_close_failed");
    }

    result
}

async fn publish_all(
    session: &AmqpSession,
    config: &Config,
    topology: &dlq::Topology,
    bodies: &[String],
) -> Result<()> {
    declare_topology(session, topology)
        .await
        .context("Failed to declare topology")?;

    for body in bodies {
        session
            .publish(
                &config.primary_exchange,
                &config.primary_routing_key,
                body.as_bytes(),
            )
            .await
            .context("Failed to publish message")?;

        info!(
            exchange = %config.primary_exchange,
            routing_key = %config.primary_routing_key,
            body_length = body.len(),
            "rabbitmq_job_published"
        );
    }

    Ok(())
}
