//! Work processor contract and the bundled simulated job.
//!
//! A processor turns one message body into a [`WorkOutcome`]. Failures are
//! values, not errors: the consume loop dead-letters the message and moves on.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Config;

/// Result of processing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Success,
    /// The message will be dead-lettered; the reason is only logged.
    Failure(String),
}

impl WorkOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        WorkOutcome::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Success)
    }
}

impl<E: fmt::Display> From<Result<(), E>> for WorkOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => WorkOutcome::Success,
            Err(e) => WorkOutcome::Failure(e.to_string()),
        }
    }
}

/// Business logic invoked once per delivery.
///
/// The consume loop awaits `process` before resolving the delivery, so a
/// processor never runs concurrently with itself on one consumer. No timeout
/// is applied here.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, body: &[u8]) -> WorkOutcome;
}

#[async_trait]
impl<F> Processor for F
where
    F: Fn(&[u8]) -> WorkOutcome + Send + Sync,
{
    async fn process(&self, body: &[u8]) -> WorkOutcome {
        self(body)
    }
}

/// Job payload expected on the primary queue.
#[derive(Debug, Deserialize)]
pub struct Job {
    /// Optional job identifier, used only for logging.
    pub id: Option<serde_json::Value>,
}

/// Stand-in job that fails with a configured probability.
///
/// With a failure probability of 1.0 every job fails, which exercises the
/// dead-letter path end to end.
#[derive(Debug, Clone)]
pub struct SimulatedProcessor {
    failure_probability: f64,
    delay_ms: (u64, u64),
}

impl SimulatedProcessor {
    /// An out-of-range probability is clamped and a non-finite one means
    /// "always fail". The delay bounds may be given in either order.
    pub fn new(failure_probability: f64, delay_ms: (u64, u64)) -> Self {
        let failure_probability = if failure_probability.is_finite() {
            failure_probability.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let (a, b) = delay_ms;
        Self {
            failure_probability,
            delay_ms: (a.min(b), a.max(b)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.simulate_failure_probability, config.work_delay_ms)
    }
}

#[async_trait]
impl Processor for SimulatedProcessor {
    async fn process(&self, body: &[u8]) -> WorkOutcome {
        let job: Job = match serde_json::from_slice(body) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    error = %e,
                    body_preview = %String::from_utf8_lossy(&body[..body.len().min(200)]),
                    "job_parse_failed"
                );
                return WorkOutcome::failure(format!("invalid job payload: {}", e));
            }
        };
        let job_id = job
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        // ThreadRng is not Send, so roll before awaiting.
        let (delay_ms, roll) = {
            let mut rng = rand::thread_rng();
            let delay = rng.gen_range(self.delay_ms.0..=self.delay_ms.1);
            let roll: f64 = rng.gen();
            (delay, roll)
        };

        if delay_ms > 0 {
            sleep(Duration::from_millis(delay_ms)).await;
        }

        let will_fail = roll < self.failure_probability;
        info!(
            job_id = %job_id,
            delay_ms = delay_ms,
            roll = roll,
            threshold = self.failure_probability,
            will_fail = will_fail,
            "job_processed"
        );

        if will_fail {
            WorkOutcome::failure("an error occurred")
        } else {
            WorkOutcome::Success
        }
    }
}
