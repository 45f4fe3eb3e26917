//! Exchange, queue and binding declarations.
//!
//! The worker's topology is two exchange/queue pairs: the primary pair carries
//! jobs, and the primary queue names the dead-letter exchange so that the
//! broker republishes every rejected (not requeued) job there.
//!
//! ```text
//! publish → primary exchange → primary queue ──reject──→ dead-letter exchange → dead-letter queue
//! ```

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::broker::BrokerSession;
use crate::error::TopologyError;

/// Queue argument naming the exchange that receives dead-lettered messages.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Routing behavior of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(TopologyError::Invalid(format!(
                "unknown exchange kind '{}'",
                other
            ))),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A queue, optionally pointing its rejected messages at a dead-letter exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_exchange: None,
        }
    }

    /// Attach dead-letter metadata. An empty name leaves the queue without it.
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        self.dead_letter_exchange = if exchange.is_empty() {
            None
        } else {
            Some(exchange)
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    /// May be empty.
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// One step of the declaration plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declaration<'a> {
    Exchange(&'a ExchangeSpec),
    Queue(&'a QueueSpec),
    Binding(&'a BindingSpec),
}

/// The primary and dead-letter exchange/queue pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub primary_exchange: ExchangeSpec,
    pub primary_queue: QueueSpec,
    pub primary_binding: BindingSpec,
    pub dead_letter_exchange: ExchangeSpec,
    pub dead_letter_queue: QueueSpec,
    pub dead_letter_binding: BindingSpec,
}

impl Topology {
    /// Build and validate a topology.
    ///
    /// The primary queue is bound to the primary exchange with `routing_key`.
    /// The dead-letter queue is bound to the dead-letter exchange with an empty
    /// key and carries no dead-letter metadata of its own.
    pub fn new(
        primary_exchange: ExchangeSpec,
        primary_queue: &str,
        routing_key: &str,
        dead_letter_exchange: ExchangeSpec,
        dead_letter_queue: &str,
    ) -> Result<Self, TopologyError> {
        let topology = Self {
            primary_binding: BindingSpec::new(primary_queue, &primary_exchange.name, routing_key),
            primary_queue: QueueSpec::new(primary_queue)
                .with_dead_letter_exchange(dead_letter_exchange.name.clone()),
            dead_letter_binding: BindingSpec::new(
                dead_letter_queue,
                &dead_letter_exchange.name,
                "",
            ),
            dead_letter_queue: QueueSpec::new(dead_letter_queue),
            primary_exchange,
            dead_letter_exchange,
        };
        topology.validate()?;
        Ok(topology)
    }

    fn validate(&self) -> Result<(), TopologyError> {
        let names = [
            ("primary exchange", &self.primary_exchange.name),
            ("primary queue", &self.primary_queue.name),
            ("dead-letter exchange", &self.dead_letter_exchange.name),
            ("dead-letter queue", &self.dead_letter_queue.name),
        ];
        for (role, name) in names {
            if name.trim().is_empty() {
                return Err(TopologyError::Invalid(format!("{} name is empty", role)));
            }
        }

        if self.primary_exchange.name == self.dead_letter_exchange.name {
            return Err(TopologyError::Invalid(format!(
                "dead-letter exchange '{}' is the primary exchange",
                self.dead_letter_exchange.name
            )));
        }
        if self.primary_queue.name == self.dead_letter_queue.name {
            return Err(TopologyError::Invalid(format!(
                "dead-letter queue '{}' is the primary queue",
                self.dead_letter_queue.name
            )));
        }

        // Dead-lettered messages keep their original routing key, and the
        // dead-letter queue is bound with an empty one.
        let key_sensitive = matches!(
            self.dead_letter_exchange.kind,
            ExchangeKind::Direct | ExchangeKind::Topic
        );
        if key_sensitive && !self.primary_binding.routing_key.is_empty() {
            return Err(TopologyError::Invalid(format!(
                "{} dead-letter exchange '{}' would drop messages routed with key '{}'",
                self.dead_letter_exchange.kind,
                self.dead_letter_exchange.name,
                self.primary_binding.routing_key
            )));
        }

        Ok(())
    }

    /// Declarations in dependency order.
    pub fn plan(&self) -> Vec<Declaration<'_>> {
        vec![
            Declaration::Exchange(&self.primary_exchange),
            Declaration::Queue(&self.primary_queue),
            Declaration::Binding(&self.primary_binding),
            Declaration::Exchange(&self.dead_letter_exchange),
            Declaration::Queue(&self.dead_letter_queue),
            Declaration::Binding(&self.dead_letter_binding),
        ]
    }
}

/// Declare every entity of `topology`, stopping at the first failure.
///
/// Safe to run on every start: redeclaring with identical parameters is a
/// no-op on the broker.
pub async fn declare_topology<S>(session: &S, topology: &Topology) -> Result<(), TopologyError>
where
    S: BrokerSession + ?Sized,
{
    for step in topology.plan() {
        match step {
            Declaration::Exchange(spec) => {
                session
                    .declare_exchange(spec)
                    .await
                    .map_err(|source| TopologyError::Exchange {
                        name: spec.name.clone(),
                        source,
                    })?;
                info!(exchange = %spec.name, kind = %spec.kind, "topology_exchange_declared");
            }
            Declaration::Queue(spec) => {
                session
                    .declare_queue(spec)
                    .await
                    .map_err(|source| TopologyError::Queue {
                        name: spec.name.clone(),
                        source,
                    })?;
                info!(
                    queue = %spec.name,
                    dead_letter_exchange = ?spec.dead_letter_exchange,
                    "topology_queue_declared"
                );
            }
            Declaration::Binding(spec) => {
                session
                    .bind_queue(spec)
                    .await
                    .map_err(|source| TopologyError::Binding {
                        queue: spec.queue.clone(),
                        exchange: spec.exchange.clone(),
                        source,
                    })?;
                info!(
                    queue = %spec.queue,
                    exchange = %spec.exchange,
                    routing_key = %spec.routing_key,
                    "topology_queue_bound"
                );
            }
        }
    }

    Ok(())
}
