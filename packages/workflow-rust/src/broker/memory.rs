//! In-memory [`QueueBroker`] for tests and local runs.
//!
//! Behaves like a peek-lock queue broker: every delivery attempt takes a lock
//! token, only the current token can settle the message, and a message whose
//! handler returns without settling is abandoned and redelivered with an
//! incremented delivery count. After `max_delivery_count` attempts the broker
//! dead-letters the message itself.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dronedelivery_core::{ApplicationProperties, LockToken, ReceivedMessage};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    BrokerError, BrokerErrorEvent, ErrorHandler, ErrorSource, MessageEvent, MessageHandler,
    MessageSettlement, QueueBroker, Subscription, SubscriptionOptions,
};

/// Dead-letter reason the broker records when it gives up on a message.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Default number of delivery attempts before the broker dead-letters a message.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// A message that ended up in a queue's dead-letter store.
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub message: ReceivedMessage,
    pub reason: String,
    pub description: String,
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// Broker holding named queues in process memory.
pub struct InMemoryBroker {
    namespace: String,
    queues: DashMap<String, Arc<QueueState>>,
    max_delivery_count: u32,
    closed: AtomicBool,
    shutdown: CancellationToken,
    next_subscription_id: AtomicU64,
}

impl InMemoryBroker {
    /// Creates an empty broker for the given namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            queues: DashMap::new(),
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Sets how many delivery attempts a message gets before it is dead-lettered.
    #[must_use]
    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count.max(1);
        self
    }

    /// Creates the queue if it does not exist yet.
    pub fn declare_queue(&self, name: &str) {
        self.queue_or_declare(name);
    }

    /// Enqueues a message with a generated id and returns that id.
    pub fn send(
        &self,
        queue: &str,
        body: impl Into<Bytes>,
        properties: ApplicationProperties,
    ) -> String {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.send_with_id(queue, message_id.clone(), body, properties);
        message_id
    }

    /// Enqueues a message under an explicit id, declaring the queue if needed.
    pub fn send_with_id(
        &self,
        queue: &str,
        message_id: impl Into<String>,
        body: impl Into<Bytes>,
        properties: ApplicationProperties,
    ) {
        self.queue_or_declare(queue).enqueue(StoredMessage {
            message_id: message_id.into(),
            body: body.into(),
            properties,
            delivery_count: 0,
        });
    }

    /// Messages completed on the queue, in settlement order.
    #[must_use]
    pub fn completed(&self, queue: &str) -> Vec<ReceivedMessage> {
        self.queue(queue)
            .map(|q| q.completed.lock().clone())
            .unwrap_or_default()
    }

    /// Messages dead-lettered on the queue, in settlement order.
    #[must_use]
    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetteredMessage> {
        self.queue(queue)
            .map(|q| q.dead_letters.lock().clone())
            .unwrap_or_default()
    }

    /// Messages waiting for delivery.
    #[must_use]
    pub fn pending_count(&self, queue: &str) -> usize {
        self.queue(queue).map_or(0, |q| q.pending.lock().len())
    }

    /// Messages currently delivered and locked but not yet settled.
    #[must_use]
    pub fn locked_count(&self, queue: &str) -> usize {
        self.queue(queue).map_or(0, |q| q.locks.len())
    }

    /// Subscriptions on the queue that have not been closed.
    #[must_use]
    pub fn open_subscriptions(&self, queue: &str) -> usize {
        self.queue(queue)
            .map_or(0, |q| q.open_subscriptions.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Makes the next `count` settlement calls on the queue fail with a
    /// transport error.
    pub fn fail_next_settlements(&self, queue: &str, count: usize) {
        self.queue_or_declare(queue)
            .failing_settlements
            .store(count, Ordering::SeqCst);
    }

    /// Reports a broker-level error to every started subscription on the queue.
    pub async fn raise_error(&self, queue: &str, source: ErrorSource, error: BrokerError) {
        if let Some(q) = self.queue(queue) {
            q.raise(source, error).await;
        }
    }

    /// Waits until every message sent to the queue has been completed or
    /// dead-lettered.
    ///
    /// Returns `false` if the timeout expires first.
    pub async fn wait_until_idle(&self, queue: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let outstanding = self
                .queue(queue)
                .map_or(0, |q| q.outstanding.load(Ordering::SeqCst));
            if outstanding == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.queues.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn queue_or_declare(&self, name: &str) -> Arc<QueueState> {
        let entry = self.queues.entry(name.to_string()).or_insert_with(|| {
            Arc::new(QueueState::new(
                name.to_string(),
                self.namespace.clone(),
                self.max_delivery_count,
            ))
        });
        Arc::clone(entry.value())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("in-memory")
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    fn fully_qualified_namespace(&self) -> &str {
        &self.namespace
    }

    async fn subscribe(
        &self,
        queue_name: &str,
        options: SubscriptionOptions,
    ) -> Result<Arc<dyn Subscription>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let queue = self
            .queue(queue_name)
            .ok_or_else(|| BrokerError::EntityNotFound(queue_name.to_string()))?;
        queue.open_subscriptions.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(InMemorySubscription {
            id: self.next_subscription_id.fetch_add(1, Ordering::Relaxed),
            queue,
            options,
            message_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
            pump: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            broker_shutdown: self.shutdown.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.shutdown.cancel();
        debug!(namespace = %self.namespace, "in-memory broker closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QueueState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Bytes,
    properties: ApplicationProperties,
    delivery_count: u32,
}

struct QueueState {
    name: String,
    namespace: String,
    max_delivery_count: u32,
    pending: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    locks: DashMap<LockToken, ()>,
    completed: Mutex<Vec<ReceivedMessage>>,
    dead_letters: Mutex<Vec<DeadLetteredMessage>>,
    failing_settlements: AtomicUsize,
    error_handlers: DashMap<u64, Arc<dyn ErrorHandler>>,
    open_subscriptions: AtomicUsize,
    /// Messages sent but not yet completed or dead-lettered.
    outstanding: AtomicUsize,
}

impl QueueState {
    fn new(name: String, namespace: String, max_delivery_count: u32) -> Self {
        Self {
            name,
            namespace,
            max_delivery_count,
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            locks: DashMap::new(),
            completed: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
            failing_settlements: AtomicUsize::new(0),
            error_handlers: DashMap::new(),
            open_subscriptions: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    fn enqueue(&self, message: StoredMessage) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.requeue(message);
    }

    fn requeue(&self, message: StoredMessage) {
        self.pending.lock().push_back(message);
        self.notify.notify_one();
    }

    fn push_completed(&self, message: ReceivedMessage) {
        self.completed.lock().push(message);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    fn push_dead_letter(&self, dead: DeadLetteredMessage) {
        self.dead_letters.lock().push(dead);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    /// Takes the next pending message and locks it for a new delivery attempt.
    fn try_lock_next(&self) -> Option<ReceivedMessage> {
        let stored = self.pending.lock().pop_front()?;
        let lock_token = LockToken::new(uuid::Uuid::new_v4().to_string());
        self.locks.insert(lock_token.clone(), ());
        Some(ReceivedMessage {
            message_id: stored.message_id,
            body: stored.body,
            properties: stored.properties,
            delivery_count: stored.delivery_count + 1,
            lock_token,
        })
    }

    /// Waits for the next message. Cancel-safe: a message is only removed
    /// from the queue in the same poll that returns it.
    async fn next_delivery(&self) -> ReceivedMessage {
        loop {
            if let Some(message) = self.try_lock_next() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    /// Releases the lock for a settlement call, or explains why it cannot.
    fn release_lock(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let injected = self
            .failing_settlements
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Transport(format!(
                "settlement of message {} failed",
                message.message_id
            )));
        }
        if self.locks.remove(&message.lock_token).is_none() {
            return Err(BrokerError::LockLost {
                message_id: message.message_id.clone(),
            });
        }
        Ok(())
    }

    /// Returns an unsettled delivery to the queue, or dead-letters it once it
    /// has used up its delivery attempts.
    fn abandon(&self, message: ReceivedMessage) {
        if message.delivery_count >= self.max_delivery_count {
            debug!(
                queue = %self.name,
                message_id = %message.message_id,
                delivery_count = message.delivery_count,
                "delivery attempts exhausted, dead-lettering"
            );
            let description = format!(
                "message was delivered {} times without being settled",
                message.delivery_count
            );
            self.push_dead_letter(DeadLetteredMessage {
                message,
                reason: MAX_DELIVERY_COUNT_EXCEEDED.to_string(),
                description,
            });
            return;
        }
        self.requeue(StoredMessage {
            message_id: message.message_id,
            body: message.body,
            properties: message.properties,
            delivery_count: message.delivery_count,
        });
    }

    async fn raise(&self, source: ErrorSource, error: BrokerError) {
        let handlers: Vec<Arc<dyn ErrorHandler>> = self
            .error_handlers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handler in handlers {
            handler
                .on_error(BrokerErrorEvent {
                    source,
                    fully_qualified_namespace: self.namespace.clone(),
                    entity_path: self.name.clone(),
                    error: error.clone(),
                })
                .await;
        }
    }

    /// Runs the handler for one delivery attempt and abandons the message if
    /// the handler left it unsettled.
    async fn deliver(
        self: Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        settlement: Arc<dyn MessageSettlement>,
        message: ReceivedMessage,
    ) {
        let lock_token = message.lock_token.clone();
        let retained = message.clone();
        let event = MessageEvent::new(message, settlement);

        let outcome = AssertUnwindSafe(handler.on_message(event))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            let detail = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            self.raise(
                ErrorSource::UserCallback,
                BrokerError::Transport(format!("message handler panicked: {detail}")),
            )
            .await;
        }

        if self.locks.remove(&lock_token).is_some() {
            self.abandon(retained);
        }
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

struct QueueSettlement {
    queue: Arc<QueueState>,
    subscription_closed: Arc<AtomicBool>,
    broker_shutdown: CancellationToken,
}

impl QueueSettlement {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.broker_shutdown.is_cancelled() || self.subscription_closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageSettlement for QueueSettlement {
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.queue.release_lock(message)?;
        self.queue.push_completed(message.clone());
        Ok(())
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.queue.release_lock(message)?;
        self.queue.push_dead_letter(DeadLetteredMessage {
            message: message.clone(),
            reason: reason.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemorySubscription
// ---------------------------------------------------------------------------

struct Pump {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct InMemorySubscription {
    id: u64,
    queue: Arc<QueueState>,
    options: SubscriptionOptions,
    message_handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    error_handler: Mutex<Option<Arc<dyn ErrorHandler>>>,
    pump: Mutex<Option<Pump>>,
    closed: Arc<AtomicBool>,
    broker_shutdown: CancellationToken,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn entity_path(&self) -> &str {
        &self.queue.name
    }

    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.message_handler.lock() = Some(handler);
    }

    fn set_error_handler(&self, handler: Arc<dyn ErrorHandler>) {
        *self.error_handler.lock() = Some(handler);
    }

    async fn start_processing(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) || self.broker_shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let (Some(handler), Some(error_handler)) = (
            self.message_handler.lock().clone(),
            self.error_handler.lock().clone(),
        ) else {
            return Err(BrokerError::HandlersMissing);
        };

        let mut pump = self.pump.lock();
        if pump.is_some() {
            return Ok(());
        }
        self.queue.error_handlers.insert(self.id, error_handler);

        let settlement: Arc<dyn MessageSettlement> = Arc::new(QueueSettlement {
            queue: Arc::clone(&self.queue),
            subscription_closed: Arc::clone(&self.closed),
            broker_shutdown: self.broker_shutdown.clone(),
        });
        let cancel = self.broker_shutdown.child_token();
        let handle = tokio::spawn(run_pump(
            Arc::clone(&self.queue),
            handler,
            settlement,
            Arc::new(Semaphore::new(self.options.max_concurrent_calls.max(1))),
            cancel.clone(),
        ));
        *pump = Some(Pump { cancel, handle });
        Ok(())
    }

    async fn stop_processing(&self) -> Result<(), BrokerError> {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.cancel.cancel();
            pump.handle
                .await
                .map_err(|e| BrokerError::Transport(format!("receive loop failed: {e}")))?;
        }
        self.queue.error_handlers.remove(&self.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let stopped = self.stop_processing().await;
        self.queue.open_subscriptions.fetch_sub(1, Ordering::SeqCst);
        stopped
    }
}

/// Receive loop: waits for a free concurrency slot, then for a message, and
/// hands the message to a dedicated task.
async fn run_pump(
    queue: Arc<QueueState>,
    handler: Arc<dyn MessageHandler>,
    settlement: Arc<dyn MessageSettlement>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_closed) => break,
            },
        };
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = queue.next_delivery() => message,
        };

        let queue = Arc::clone(&queue);
        let handler = Arc::clone(&handler);
        let settlement = Arc::clone(&settlement);
        tokio::spawn(async move {
            queue.deliver(handler, settlement, message).await;
            drop(permit);
        });
    }
    debug!(queue = %queue.name, "receive loop stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
