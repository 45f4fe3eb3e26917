//! In-process broker.
//!
//! Implements the subset of AMQP 0-9-1 semantics the worker relies on:
//! exchange routing, dead-lettering on reject-without-requeue, per-session
//! prefetch and single-delivery acknowledgment. Nothing is persisted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{BrokerSession, Delivery, DeliveryStream, DeliveryTag};
use crate::error::BrokerError;
use crate::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

struct QueueData {
    dead_letter_exchange: Option<String>,
    messages: VecDeque<Message>,
}

/// Delivered to a session, not yet acked or rejected.
struct Unacked {
    queue: String,
    message: Message,
}

#[derive(Default)]
struct SessionState {
    /// 0 means unlimited.
    prefetch: u16,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueData>,
    bindings: Vec<BindingSpec>,
    sessions: HashMap<u64, SessionState>,
    next_session: u64,
    next_tag: u64,
}

enum Take {
    Delivery(Delivery),
    Wait,
    Closed,
}

impl State {
    fn route(&mut self, exchange: &str, routing_key: &str, message: Message) -> Result<usize, BrokerError> {
        // Default exchange: routes to the queue named by the key.
        if exchange.is_empty() {
            return Ok(match self.queues.get_mut(routing_key) {
                Some(queue) => {
                    queue.messages.push_back(message);
                    1
                }
                None => 0,
            });
        }

        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            if binding_matches(kind, &binding.routing_key, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        let mut routed = 0;
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.messages.push_back(message.clone());
                routed += 1;
            }
        }
        Ok(routed)
    }

    fn dead_letter(&mut self, queue: &str, message: Message) {
        let exchange = match self.queues.get(queue).and_then(|q| q.dead_letter_exchange.clone()) {
            Some(exchange) => exchange,
            None => {
                debug!(queue = queue, "memory_broker_message_discarded");
                return;
            }
        };

        let routing_key = message.routing_key.clone();
        let message = Message {
            redelivered: false,
            ..message
        };
        match self.route(&exchange, &routing_key, message) {
            Ok(0) => warn!(
                queue = queue,
                exchange = %exchange,
                routing_key = %routing_key,
                "memory_broker_dead_letter_unroutable"
            ),
            Ok(_) => debug!(queue = queue, exchange = %exchange, "memory_broker_dead_lettered"),
            Err(_) => warn!(
                queue = queue,
                exchange = %exchange,
                "memory_broker_dead_letter_exchange_missing"
            ),
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.messages.push_front(Message {
                redelivered: true,
                ..unacked.message
            });
        }
    }

    fn take(&mut self, session: u64, queue: &str) -> Take {
        let state = match self.sessions.get(&session) {
            Some(state) => state,
            None => return Take::Closed,
        };
        if state.prefetch != 0 && state.unacked.len() >= state.prefetch as usize {
            return Take::Wait;
        }

        let message = match self.queues.get_mut(queue).and_then(|q| q.messages.pop_front()) {
            Some(message) => message,
            None => return Take::Wait,
        };

        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery {
            body: message.body.clone(),
            tag: DeliveryTag(tag),
            redelivered: message.redelivered,
            routing_key: message.routing_key.clone(),
        };

        if let Some(state) = self.sessions.get_mut(&session) {
            state.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    message,
                },
            );
        }
        Take::Delivery(delivery)
    }
}

/// Does a binding with `pattern` accept a message published with `key`?
///
/// Headers bindings carry no arguments here, which matches every message.
fn binding_matches(kind: ExchangeKind, pattern: &str, key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => pattern == key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = pattern.split('.').collect();
            let key: Vec<&str> = key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

/// `*` matches exactly one word, `#` matches zero or more.
fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| topic_matches(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && topic_matches(rest, key_rest),
            None => false,
        },
    }
}

struct Inner {
    state: Mutex<State>,
    /// Woken whenever a queue gains a message or a session frees capacity.
    changed: Notify,
}

/// Shared broker state. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Open a new session (the equivalent of a connection plus channel).
    pub fn session(&self) -> MemorySession {
        let mut state = self.inner.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(id, SessionState::default());
        MemorySession {
            broker: self.clone(),
            id,
        }
    }

    /// Number of ready messages in `queue`, or `None` if it does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
    }

    /// Bodies of the ready messages in `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet resolved, across all sessions.
    pub fn in_flight(&self) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .map(|s| s.unacked.len())
            .sum()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A session on a [`MemoryBroker`]. Clones share the same session.
#[derive(Clone)]
pub struct MemorySession {
    broker: MemoryBroker,
    id: u64,
}

impl MemorySession {
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut State) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let mut state = self.broker.inner.state.lock();
        if !state.sessions.contains_key(&self.id) {
            return Err(BrokerError::Closed);
        }
        f(&mut state)
    }

    fn resolve(&self, tag: DeliveryTag, requeue: Option<bool>) -> Result<(), BrokerError> {
        self.with_session(|state| {
            let unacked = state
                .sessions
                .get_mut(&self.id)
                .and_then(|s| s.unacked.remove(&tag.0))
                .ok_or(BrokerError::UnknownDeliveryTag(tag.0))?;

            match requeue {
                None => {}
                Some(true) => state.requeue(unacked),
                Some(false) => state.dead_letter(&unacked.queue, unacked.message),
            }
            Ok(())
        })?;
        self.broker.inner.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.with_session(|state| match state.exchanges.get(&spec.name) {
            Some(kind) if *kind != spec.kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{}' exists with kind {}, declared as {}",
                spec.name, kind, spec.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.kind);
                Ok(())
            }
        })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.with_session(|state| match state.queues.get(&spec.name) {
            Some(queue) if queue.dead_letter_exchange != spec.dead_letter_exchange => {
                Err(BrokerError::PreconditionFailed(format!(
                    "queue '{}' exists with dead-letter exchange {:?}, declared with {:?}",
                    spec.name, queue.dead_letter_exchange, spec.dead_letter_exchange
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueData {
                        dead_letter_exchange: spec.dead_letter_exchange.clone(),
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        })
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), BrokerError> {
        self.with_session(|state| {
            if !state.exchanges.contains_key(&spec.exchange) {
                return Err(BrokerError::NotFound(format!("exchange '{}'", spec.exchange)));
            }
            if !state.queues.contains_key(&spec.queue) {
                return Err(BrokerError::NotFound(format!("queue '{}'", spec.queue)));
            }
            if !state.bindings.contains(spec) {
                state.bindings.push(spec.clone());
            }
            Ok(())
        })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.with_session(|state| {
            if let Some(session) = state.sessions.get_mut(&self.id) {
                session.prefetch = count;
            }
            Ok(())
        })?;
        self.broker.inner.changed.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.with_session(|state| {
            if state.queues.contains_key(queue) {
                Ok(())
            } else {
                Err(BrokerError::NotFound(format!("queue '{}'", queue)))
            }
        })?;

        let inner = Arc::clone(&self.broker.inner);
        let session = self.id;
        let queue = queue.to_string();

        let stream = futures::stream::unfold((inner, session, queue), |(inner, session, queue)| async move {
            loop {
                // Registered before inspecting state so no wakeup is missed.
                let changed = inner.changed.notified();
                let take = inner.state.lock().take(session, &queue);
                match take {
                    Take::Delivery(delivery) => {
                        drop(changed);
                        return Some((Ok::<_, BrokerError>(delivery), (inner, session, queue)));
                    }
                    Take::Closed => return None,
                    Take::Wait => changed.await,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.resolve(tag, None)
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.resolve(tag, Some(requeue))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let routed = self.with_session(|state| {
            state.route(
                exchange,
                routing_key,
                Message {
                    body: body.to_vec(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                },
            )
        })?;

        if routed == 0 {
            debug!(exchange = exchange, routing_key = routing_key, "memory_broker_unroutable");
        }
        self.broker.inner.changed.notify_waiters();
        Ok(())
    }

    /// Ends this session's subscriptions and requeues its unresolved deliveries.
    async fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.inner.state.lock();
            if let Some(session) = state.sessions.remove(&self.id) {
                let mut unacked: Vec<(u64, Unacked)> = session.unacked.into_iter().collect();
                // Highest tag first so the oldest delivery ends up at the head.
                unacked.sort_by(|a, b| b.0.cmp(&a.0));
                for (_, message) in unacked {
                    state.requeue(message);
                }
            }
        }
        self.broker.inner.changed.notify_waiters();
        Ok(())
    }
}
