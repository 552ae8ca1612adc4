//! End-to-end consumer scenarios against the in-memory broker.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dronedelivery_core::{
    encode, ApplicationProperties, DeliveryRequest, PackageInfo, PackageSize, PropertyValue,
};
use dronedelivery_workflow::broker::ErrorSource;
use dronedelivery_workflow::storage::{
    FleetScheduler, InMemoryDeliveryRepository, InMemoryPackageRegistry,
};
use dronedelivery_workflow::{
    in_memory_factory, processor_fn, BrokerError, DeliveryRepository, Host, InMemoryBroker,
    ProcessError, RequestProcessor, WorkflowConfig, WorkflowProcessor, WorkflowService,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

const QUEUE: &str = "deliveryrequests";
const IDLE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Captured log output.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

fn config() -> Arc<WorkflowConfig> {
    Arc::new(WorkflowConfig {
        max_concurrent_calls: 4,
        drain_timeout: Duration::from_secs(2),
        ..WorkflowConfig::default()
    })
}

fn request(id: &str) -> Vec<u8> {
    let request = DeliveryRequest::new(id).with_package(PackageInfo {
        package_id: format!("pkg-{id}"),
        size: PackageSize::Small,
        weight: 1.5,
        tag: String::new(),
    });
    encode(&request).unwrap()
}

/// Processor that counts calls and succeeds.
fn counting_processor(calls: Arc<AtomicU32>) -> Arc<dyn RequestProcessor> {
    Arc::new(processor_fn(move |_, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    }))
}

async fn started_service(
    broker: &Arc<InMemoryBroker>,
    processor: Arc<dyn RequestProcessor>,
) -> WorkflowService {
    let service = WorkflowService::new(config(), processor, in_memory_factory(Arc::clone(broker)));
    service.start(&CancellationToken::new()).await.unwrap();
    service
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn well_formed_request_is_scheduled_and_completed() {
    let broker = Arc::new(InMemoryBroker::new("test"));
    let deliveries = Arc::new(InMemoryDeliveryRepository::new());
    let processor = Arc::new(WorkflowProcessor::new(
        deliveries.clone(),
        Arc::new(InMemoryPackageRegistry::new()),
        Arc::new(FleetScheduler::new(["drone-1"])),
        5,
    ));
    let service = started_service(&broker, processor).await;

    let properties = ApplicationProperties::new().with("correlationId", "corr-1");
    broker.send_with_id(QUEUE, "m-D1", request("D1"), properties);
    assert!(broker.wait_until_idle(QUEUE, IDLE).await);

    let completed = broker.completed(QUEUE);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].message_id, "m-D1");
    assert_eq!(
        completed[0].properties.get("correlationId"),
        Some(&PropertyValue::from("corr-1"))
    );
    assert!(broker.dead_letters(QUEUE).is_empty());
    assert!(deliveries.get("D1", "D1").await.unwrap().is_some());

    service.stop(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered_without_processing() {
    let broker = Arc::new(InMemoryBroker::new("test"));
    let calls = Arc::new(AtomicU32::new(0));
    let service = started_service(&broker, counting_processor(calls.clone())).await;

    broker.send_with_id(QUEUE, "m-bad", "{not json", ApplicationProperties::new());
    assert!(broker.wait_until_idle(QUEUE, IDLE).await);

    let dead = broker.dead_letters(QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.message_id, "m-bad");
    assert_eq!(dead[0].reason, "UnparseablePayload");
    assert!(broker.completed(QUEUE).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    service.stop(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn processing_fault_is_logged_and_dead_lettered() {
    let (logs, _guard) = capture_logs();
    let broker = Arc::new(InMemoryBroker::new("test"));
    let processor: Arc<dyn RequestProcessor> = Arc::new(processor_fn(|request, _| async move {
        Err(ProcessError::Fault(anyhow::anyhow!(
            "document store unavailable while saving {}",
            request.delivery_id
        )))
    }));
    let service = started_service(&broker, processor).await;

    broker.send_with_id(QUEUE, "m-D2", request("D2"), ApplicationProperties::new());
    assert!(broker.wait_until_idle(QUEUE, IDLE).await);

    let dead = broker.dead_letters(QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "ProcessingFailed");
    assert_eq!(dead[0].message.delivery_count, 1);
    assert!(broker.completed(QUEUE).is_empty());

    let output = logs.contents();
    assert!(
        output
            .lines()
            .any(|line| line.contains("ERROR") && line.contains("D2")),
        "no error entry mentions D2:\n{output}"
    );

    service.stop(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn rejected_request_is_dead_lettered_once() {
    let (logs, _guard) = capture_logs();
    let broker = Arc::new(InMemoryBroker::new("test"));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let processor: Arc<dyn RequestProcessor> = Arc::new(processor_fn(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(ProcessError::rejected("delivery window closed")) }
    }));
    let service = started_service(&broker, processor).await;

    broker.send_with_id(QUEUE, "m-D3", request("D3"), ApplicationProperties::new());
    assert!(broker.wait_until_idle(QUEUE, IDLE).await);

    let dead = broker.dead_letters(QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "ProcessingRejected");
    assert!(dead[0].description.contains("delivery window closed"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let output = logs.contents();
    assert!(
        output.lines().any(|line| line.contains("WARN")
            && line.contains("delivery window closed")
            && line.contains("m-D3")),
        "no warning carries the rejection reason:\n{output}"
    );

    service.stop(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn failed_resolution_does_not_block_other_messages() {
    let broker = Arc::new(InMemoryBroker::new("test"));
    let calls = Arc::new(AtomicU32::new(0));
    let service = started_service(&broker, counting_processor(calls.clone())).await;

    // The first settlement attempt fails; that message is redelivered.
    broker.fail_next_settlements(QUEUE, 1);
    broker.send_with_id(QUEUE, "m-1", request("A1"), ApplicationProperties::new());
    broker.send_with_id(QUEUE, "m-2", request("A2"), ApplicationProperties::new());
    assert!(broker.wait_until_idle(QUEUE, IDLE).await);

    let completed = broker.completed(QUEUE);
    assert_eq!(completed.len(), 2);
    assert!(completed.iter().any(|m| m.delivery_count == 2));
    assert!(broker.dead_letters(QUEUE).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    service.stop(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn messages_are_processed_concurrently() {
    let broker = Arc::new(InMemoryBroker::new("test"));
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let processor: Arc<dyn RequestProcessor> = Arc::new(processor_fn(move |_, _| {
        let barrier = Arc::clone(&barrier);
        async move {
            // Both requests must be in flight at once to pass the barrier.
            barrier.wait().await;
            Ok(())
        }
    }));
    let service = started_service(&broker, processor).await;

    broker.send(QUEUE, request("A"), ApplicationProperties::new());
    broker.send(QUEUE, request("B"), ApplicationProperties::new());
    assert!(broker.wait_until_idle(QUEUE, IDLE).await);

    assert_eq!(broker.completed(QUEUE).len(), 2);
    assert!(broker.dead_letters(QUEUE).is_empty());

    service.stop(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn broker_errors_do_not_stop_consumption() {
    let (logs, _guard) = capture_logs();
    let broker = Arc::new(InMemoryBroker::new("test"));
    let calls = Arc::new(AtomicU32::new(0));
    let service = started_service(&broker, counting_processor(calls.clone())).await;

    broker
        .raise_error(
            QUEUE,
            ErrorSource::Receive,
            BrokerError::Transport("connection reset by peer".to_string()),
        )
        .await;
    broker.send(QUEUE, request("D4"), ApplicationProperties::new());
    assert!(broker.wait_until_idle(QUEUE, IDLE).await);

    assert_eq!(broker.completed(QUEUE).len(), 1);
    let output = logs.contents();
    assert!(output.contains("connection reset by peer"));
    assert!(output.contains("entity_path=deliveryrequests"));

    service.stop(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn stop_is_safe_before_start_and_twice() {
    let broker = Arc::new(InMemoryBroker::new("test"));
    let service = WorkflowService::new(
        config(),
        counting_processor(Arc::default()),
        in_memory_factory(broker.clone()),
    );
    let cancel = CancellationToken::new();

    service.stop(&cancel).await.unwrap();
    service.start(&cancel).await.unwrap();
    service.stop(&cancel).await.unwrap();
    service.stop(&cancel).await.unwrap();
    assert_eq!(broker.open_subscriptions(QUEUE), 0);
}

#[tokio::test]
async fn startup_failure_propagates_through_host() {
    let broker = Arc::new(InMemoryBroker::new("test"));
    // Factory that never declares the queue.
    let shared = broker.clone();
    let factory: dronedelivery_workflow::BrokerFactory = Arc::new(
        move |_: &WorkflowConfig| -> Result<Arc<dyn dronedelivery_workflow::QueueBroker>, BrokerError> {
            Ok(shared.clone() as Arc<dyn dronedelivery_workflow::QueueBroker>)
        },
    );
    let host = Host::new();
    host.register(Arc::new(WorkflowService::new(
        config(),
        counting_processor(Arc::default()),
        factory,
    )));

    let err = host.start_all(&CancellationToken::new()).await.unwrap_err();

    let rendered = format!("{err:#}");
    assert!(rendered.contains("starting service workflow"));
    assert!(rendered.contains(QUEUE));
    assert!(broker.is_closed());
}
