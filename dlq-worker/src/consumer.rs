//! Consume loop: one delivery at a time, acked on success, dead-lettered on
//! failure.
//!
//! The loop:
//! 1. Sets the prefetch count to 1 so the broker holds back the next delivery
//!    until the current one is resolved
//! 2. Subscribes to the primary queue with manual acknowledgment
//! 3. Runs the processor on each delivery, in arrival order
//! 4. Acks on success, rejects without requeue on failure (the broker then
//!    republishes the message to the queue's dead-letter exchange)
//! 5. Stops when the subscription ends or the shutdown future completes
//!
//! A delivery that is being processed when shutdown is requested is still
//! resolved before the loop returns.

use std::future::Future;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::broker::{BrokerSession, Delivery};
use crate::error::{BrokerError, WorkerError};
use crate::processor::{Processor, WorkOutcome};

/// Unresolved deliveries allowed per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Why the consume loop returned without an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown future completed.
    #[default]
    Requested,
    /// The broker ended the subscription (consumer cancelled or channel
    /// closed) while no stop was requested.
    SubscriptionEnded,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub received: u64,
    pub acked: u64,
    pub dead_lettered: u64,
    pub stopped_by: StopReason,
}

/// Consume loop bound to one session and one queue.
///
/// The session's channel belongs to this loop while it runs. Scale out by
/// running more loops, each on its own session.
pub struct ConsumeLoop<'s, S: ?Sized, P> {
    session: &'s S,
    processor: P,
    queue: String,
    consumer_tag: String,
}

impl<'s, S, P> ConsumeLoop<'s, S, P>
where
    S: BrokerSession + ?Sized,
    P: Processor,
{
    pub fn new(
        session: &'s S,
        processor: P,
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
    ) -> Self {
        Self {
            session,
            processor,
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
        }
    }

    /// Run until the subscription closes or `shutdown` completes.
    ///
    /// Processing failures never stop the loop. Any broker error (subscribe,
    /// delivery, ack or reject) does, and is returned.
    pub async fn run<F>(&self, shutdown: F) -> Result<ConsumeStats, WorkerError>
    where
        F: Future<Output = ()>,
    {
        self.session.set_prefetch(PREFETCH_COUNT).await?;

        let mut deliveries = self
            .session
            .consume(&self.queue, &self.consumer_tag)
            .await?;

        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "worker_ready");

        let mut stats = ConsumeStats::default();

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("worker_stopping");
                    break;
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            stats.received += 1;
                            self.handle(delivery, &mut stats).await?;
                        }
                        Some(Err(e)) => {
                            error!(queue = %self.queue, error = %e, "rabbitmq_delivery_error");
                            return Err(e.into());
                        }
                        None => {
                            warn!(queue = %self.queue, "rabbitmq_consumer_closed");
                            stats.stopped_by = StopReason::SubscriptionEnded;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            received = stats.received,
            acked = stats.acked,
            dead_lettered = stats.dead_lettered,
            stopped_by = ?stats.stopped_by,
            "consume_loop_finished"
        );
        Ok(stats)
    }

    /// Process one delivery and resolve it exactly once.
    async fn handle(&self, delivery: Delivery, stats: &mut ConsumeStats) -> Result<(), BrokerError> {
        let tag = delivery.tag;

        info!(
            queue = %self.queue,
            delivery_tag = tag.0,
            redelivered = delivery.redelivered,
            body_length = delivery.body.len(),
            "delivery_received"
        );

        match self.processor.process(&delivery.body).await {
            WorkOutcome::Success => {
                self.session.ack(tag).await.map_err(|e| {
                    error!(delivery_tag = tag.0, error = %e, "rabbitmq_ack_failed");
                    e
                })?;
                stats.acked += 1;
                info!(delivery_tag = tag.0, "delivery_acked");
            }
            WorkOutcome::Failure(reason) => {
                self.session.reject(tag, false).await.map_err(|e| {
                    error!(delivery_tag = tag.0, error = %e, "rabbitmq_reject_failed");
                    e
                })?;
                stats.dead_lettered += 1;
                warn!(delivery_tag = tag.0, reason = %reason, "delivery_dead_lettered");
            }
        }

        Ok(())
    }
}
