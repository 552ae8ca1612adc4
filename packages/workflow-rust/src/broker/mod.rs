//! Queue broker abstraction.
//!
//! The consumer talks to the broker only through these traits, so a fake
//! broker can stand in for the real client in tests and local runs:
//!
//! - [`QueueBroker`]: a connected client that can open subscriptions
//! - [`Subscription`]: one queue subscription with a message handler and an
//!   error handler registered on it
//! - [`MessageSettlement`]: completes or dead-letters one delivery attempt

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dronedelivery_core::ReceivedMessage;

pub use memory::{DeadLetteredMessage, InMemoryBroker};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("cannot connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("messaging entity not found: {0}")]
    EntityNotFound(String),
    #[error("lock lost for message {message_id}")]
    LockLost { message_id: String },
    #[error("broker client is closed")]
    Closed,
    #[error("message and error handlers must be registered before processing starts")]
    HandlersMissing,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Stage of broker interaction an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Receive,
    Complete,
    DeadLetter,
    Abandon,
    /// The registered message handler failed or panicked.
    UserCallback,
}

impl ErrorSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::Complete => "complete",
            Self::DeadLetter => "dead_letter",
            Self::Abandon => "abandon",
            Self::UserCallback => "user_callback",
        }
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-level error delivered on a subscription's error channel.
#[derive(Debug, Clone)]
pub struct BrokerErrorEvent {
    pub source: ErrorSource,
    pub fully_qualified_namespace: String,
    pub entity_path: String,
    pub error: BrokerError,
}

// ---------------------------------------------------------------------------
// Settlement and handlers
// ---------------------------------------------------------------------------

/// Settles a single delivery attempt.
#[async_trait]
pub trait MessageSettlement: Send + Sync {
    /// Acknowledges the message, removing it from the active queue.
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Moves the message to the dead-letter queue with a reason and description.
    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError>;
}

/// One delivered message together with the means to settle it.
pub struct MessageEvent {
    pub message: ReceivedMessage,
    settlement: Arc<dyn MessageSettlement>,
}

impl MessageEvent {
    #[must_use]
    pub fn new(message: ReceivedMessage, settlement: Arc<dyn MessageSettlement>) -> Self {
        Self {
            message,
            settlement,
        }
    }

    /// Completes this delivery attempt.
    ///
    /// # Errors
    ///
    /// Propagates the broker's settlement error.
    pub async fn complete(&self) -> Result<(), BrokerError> {
        self.settlement.complete(&self.message).await
    }

    /// Dead-letters this delivery attempt.
    ///
    /// # Errors
    ///
    /// Propagates the broker's settlement error.
    pub async fn dead_letter(&self, reason: &str, description: &str) -> Result<(), BrokerError> {
        self.settlement
            .dead_letter(&self.message, reason, description)
            .await
    }
}

impl fmt::Debug for MessageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEvent")
            .field("message_id", &self.message.message_id)
            .field("delivery_count", &self.message.delivery_count)
            .finish_non_exhaustive()
    }
}

/// Callback invoked for every delivered message.
///
/// May be invoked concurrently for different messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, event: MessageEvent);
}

/// Callback invoked for broker-level errors. Never on the message path.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, event: BrokerErrorEvent);
}

// ---------------------------------------------------------------------------
// Subscription and broker
// ---------------------------------------------------------------------------

/// Options applied when opening a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Maximum number of messages dispatched to the handler at once.
    pub max_concurrent_calls: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
        }
    }
}

/// A subscription to one queue.
///
/// Handlers are registered first, then `start_processing` begins push
/// delivery. `stop_processing` stops new deliveries without waiting for
/// in-flight handlers; `close` releases the subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Name of the queue this subscription reads from.
    fn entity_path(&self) -> &str;

    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>);

    fn set_error_handler(&self, handler: Arc<dyn ErrorHandler>);

    /// Begins delivering messages to the registered handler.
    async fn start_processing(&self) -> Result<(), BrokerError>;

    /// Stops delivering new messages.
    async fn stop_processing(&self) -> Result<(), BrokerError>;

    /// Releases the subscription. Settlements after close fail.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A connected broker client.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Namespace the client is connected to, used in error reports.
    fn fully_qualified_namespace(&self) -> &str;

    /// Opens a subscription to the named queue.
    async fn subscribe(
        &self,
        queue_name: &str,
        options: SubscriptionOptions,
    ) -> Result<Arc<dyn Subscription>, BrokerError>;

    /// Closes the client and its underlying connection.
    async fn close(&self) -> Result<(), BrokerError>;
}
