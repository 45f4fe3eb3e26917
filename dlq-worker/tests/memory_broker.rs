//! End-to-end worker behavior against the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Semaphore};

use dlq::worker::serve;
use dlq::{
    declare_topology, BrokerSession, ConsumeStats, ExchangeKind, ExchangeSpec, MemoryBroker,
    Processor, SimulatedProcessor, StopReason, Topology, WorkOutcome, WorkerError,
};

const PRIMARY_EXCHANGE: &str = "test.exchange";
const PRIMARY_QUEUE: &str = "test_queue";
const DEAD_LETTER_QUEUE: &str = "test_queue.dead-letter";

fn topology() -> Topology {
    Topology::new(
        ExchangeSpec::new(PRIMARY_EXCHANGE, ExchangeKind::Direct),
        PRIMARY_QUEUE,
        "",
        ExchangeSpec::new("test.exchange.dead-letter", ExchangeKind::Fanout),
        DEAD_LETTER_QUEUE,
    )
    .unwrap()
}

/// Start a worker on its own session. Dropping or firing the sender stops it.
fn spawn_worker<P>(
    broker: &MemoryBroker,
    processor: P,
) -> (
    oneshot::Sender<()>,
    tokio::task::JoinHandle<Result<ConsumeStats, WorkerError>>,
)
where
    P: Processor + 'static,
{
    let session = broker.session();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        serve(&session, &topology(), "test", processor, async {
            let _ = stop_rx.await;
        })
        .await
    });
    (stop_tx, handle)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Blocks inside `process` until a permit is added to the gate.
struct GatedProcessor {
    entered: mpsc::UnboundedSender<Vec<u8>>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Processor for GatedProcessor {
    async fn process(&self, body: &[u8]) -> WorkOutcome {
        let _ = self.entered.send(body.to_vec());
        match self.gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return WorkOutcome::failure("gate closed"),
        }
        WorkOutcome::Success
    }
}

fn gated() -> (GatedProcessor, mpsc::UnboundedReceiver<Vec<u8>>, Arc<Semaphore>) {
    let (entered, entered_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));
    let processor = GatedProcessor {
        entered,
        gate: Arc::clone(&gate),
    };
    (processor, entered_rx, gate)
}

#[tokio::test]
async fn failed_job_lands_in_dead_letter_queue() {
    let broker = MemoryBroker::new();
    let publisher = broker.session();
    declare_topology(&publisher, &topology()).await.unwrap();

    let (stop, handle) = spawn_worker(&broker, SimulatedProcessor::new(1.0, (0, 0)));

    publisher
        .publish(PRIMARY_EXCHANGE, "", br#"{"id":1}"#)
        .await
        .unwrap();

    wait_until(|| broker.queue_len(DEAD_LETTER_QUEUE) == Some(1) && broker.in_flight() == 0).await;
    stop.send(()).unwrap();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.received, 1);
    assert_eq!(stats.acked, 0);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(broker.queue_len(PRIMARY_QUEUE), Some(0));
    assert_eq!(broker.messages(DEAD_LETTER_QUEUE), vec![br#"{"id":1}"#.to_vec()]);
}

#[tokio::test]
async fn successful_job_is_acked_and_gone() {
    let broker = MemoryBroker::new();
    let publisher = broker.session();
    declare_topology(&publisher, &topology()).await.unwrap();

    let (stop, handle) = spawn_worker(&broker, SimulatedProcessor::new(0.0, (0, 0)));

    publisher
        .publish(PRIMARY_EXCHANGE, "", br#"{"id":2}"#)
        .await
        .unwrap();

    wait_until(|| broker.queue_len(PRIMARY_QUEUE) == Some(0) && broker.in_flight() == 0).await;
    // Give a wrongly dead-lettered message the chance to show up.
    tokio::time::sleep(Duration::from_millis(20)).await;
    stop.send(()).unwrap();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.received, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(broker.queue_len(PRIMARY_QUEUE), Some(0));
    assert_eq!(broker.queue_len(DEAD_LETTER_QUEUE), Some(0));
}

#[tokio::test]
async fn every_delivery_is_resolved_once_by_outcome() {
    let broker = MemoryBroker::new();
    let publisher = broker.session();
    declare_topology(&publisher, &topology()).await.unwrap();

    for id in 0..10 {
        let body = format!(r#"{{"id":{}}}"#, id);
        publisher
            .publish(PRIMARY_EXCHANGE, "", body.as_bytes())
            .await
            .unwrap();
    }

    // Even ids succeed, odd ids fail.
    let processor = |body: &[u8]| {
        let value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => return WorkOutcome::failure(e.to_string()),
        };
        match value["id"].as_u64() {
            Some(id) if id % 2 == 0 => WorkOutcome::Success,
            _ => WorkOutcome::failure("odd id"),
        }
    };
    let (stop, handle) = spawn_worker(&broker, processor);

    wait_until(|| broker.queue_len(DEAD_LETTER_QUEUE) == Some(5) && broker.in_flight() == 0).await;
    wait_until(|| broker.queue_len(PRIMARY_QUEUE) == Some(0)).await;
    stop.send(()).unwrap();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.received, 10);
    assert_eq!(stats.acked, 5);
    assert_eq!(stats.dead_lettered, 5);

    // Dead-lettered in arrival order.
    let expected: Vec<Vec<u8>> = [1, 3, 5, 7, 9]
        .iter()
        .map(|id| format!(r#"{{"id":{}}}"#, id).into_bytes())
        .collect();
    assert_eq!(broker.messages(DEAD_LETTER_QUEUE), expected);
}

#[tokio::test]
async fn prefetch_allows_one_outstanding_delivery() {
    let broker = MemoryBroker::new();
    let publisher = broker.session();
    declare_topology(&publisher, &topology()).await.unwrap();
    for body in ["a", "b", "c"] {
        publisher
            .publish(PRIMARY_EXCHANGE, "", body.as_bytes())
            .await
            .unwrap();
    }

    let (processor, mut entered, gate) = gated();
    let (stop, handle) = spawn_worker(&broker, processor);

    assert_eq!(entered.recv().await.unwrap(), b"a".to_vec());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(entered.try_recv().is_err());
    assert_eq!(broker.in_flight(), 1);
    assert_eq!(broker.queue_len(PRIMARY_QUEUE), Some(2));

    gate.add_permits(1);
    assert_eq!(entered.recv().await.unwrap(), b"b".to_vec());
    assert_eq!(broker.in_flight(), 1);
    assert_eq!(broker.queue_len(PRIMARY_QUEUE), Some(1));

    gate.add_permits(2);
    assert_eq!(entered.recv().await.unwrap(), b"c".to_vec());
    wait_until(|| broker.in_flight() == 0).await;

    stop.send(()).unwrap();
    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.acked, 3);
    assert_eq!(broker.queue_len(PRIMARY_QUEUE), Some(0));
}

#[tokio::test]
async fn stop_signal_resolves_in_flight_delivery_first() {
    let broker = MemoryBroker::new();
    let publisher = broker.session();
    declare_topology(&publisher, &topology()).await.unwrap();
    for body in ["a", "b", "c"] {
        publisher
            .publish(PRIMARY_EXCHANGE, "", body.as_bytes())
            .await
            .unwrap();
    }

    let (processor, mut entered, gate) = gated();
    let (stop, handle) = spawn_worker(&broker, processor);

    assert_eq!(entered.recv().await.unwrap(), b"a".to_vec());
    stop.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_finished());

    gate.add_permits(10);
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.received, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.stopped_by, StopReason::Requested);
    assert_eq!(broker.in_flight(), 0);
    assert_eq!(broker.messages(PRIMARY_QUEUE), vec![b"b".to_vec(), b"c".to_vec()]);
}

#[tokio::test]
async fn independent_workers_share_the_queue() {
    let broker = MemoryBroker::new();
    let publisher = broker.session();
    declare_topology(&publisher, &topology()).await.unwrap();

    let (stop_a, handle_a) = spawn_worker(&broker, |_: &[u8]| WorkOutcome::Success);
    let (stop_b, handle_b) = spawn_worker(&broker, |_: &[u8]| WorkOutcome::failure("b fails"));

    for id in 0..6 {
        let body = format!(r#"{{"id":{}}}"#, id);
        publisher
            .publish(PRIMARY_EXCHANGE, "", body.as_bytes())
            .await
            .unwrap();
        assert!(broker.in_flight() <= 2);
    }

    wait_until(|| broker.queue_len(PRIMARY_QUEUE) == Some(0) && broker.in_flight() == 0).await;
    stop_a.send(()).unwrap();
    stop_b.send(()).unwrap();
    let a = handle_a.await.unwrap().unwrap();
    let b = handle_b.await.unwrap().unwrap();

    assert_eq!(a.received + b.received, 6);
    assert_eq!(a.dead_lettered, 0);
    assert_eq!(b.acked, 0);
    assert_eq!(broker.queue_len(DEAD_LETTER_QUEUE), Some(b.dead_lettered as usize));
}

#[tokio::test]
async fn redeclaring_topology_does_not_duplicate_routes() {
    let broker = MemoryBroker::new();
    let first = broker.session();
    let second = broker.session();

    declare_topology(&first, &topology()).await.unwrap();
    declare_topology(&second, &topology()).await.unwrap();
    declare_topology(&first, &topology()).await.unwrap();

    first
        .publish(PRIMARY_EXCHANGE, "", br#"{"id":3}"#)
        .await
        .unwrap();

    assert_eq!(broker.queue_len(PRIMARY_QUEUE), Some(1));
    assert_eq!(broker.queue_len(DEAD_LETTER_QUEUE), Some(0));
}
