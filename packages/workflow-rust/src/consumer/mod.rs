//! Queue consumer loop.
//!
//! Binds a broker subscription to the processing pipeline. State is
//! published lock-free through `ArcSwap`:
//!
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!
//! A failed start falls back to `Stopped`. `start` and `stop` are serialized
//! by an async mutex around the active subscription, so concurrent callers
//! never observe a half-built subscription.

pub mod dispatch;
pub mod drain;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{error, info, warn};

use crate::broker::{BrokerError, QueueBroker, Subscription, SubscriptionOptions};
use crate::config::WorkflowConfig;
use crate::processor::{build_processor_pipeline, RequestProcessor};

pub use dispatch::{BrokerErrorLogger, DeliveryDispatcher, BROKER_ERRORS_TOTAL, MESSAGES_TOTAL};
pub use drain::{InFlightGuard, InFlightTracker};

/// Lifecycle state of a [`QueueConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// No subscription is held.
    Stopped,
    /// Acquiring the subscription and registering handlers.
    Starting,
    /// Messages are being delivered.
    Running,
    /// Deliveries stopped; draining in-flight dispatches before release.
    Stopping,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by [`QueueConsumer::start`] and [`QueueConsumer::stop`].
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("cannot subscribe to queue {queue}: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("cannot start processing on queue {queue}: {source}")]
    StartProcessing {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("stopping consumer on queue {queue} failed: {}", join_errors(.errors))]
    Stop {
        queue: String,
        errors: Vec<BrokerError>,
    },
}

fn join_errors(errors: &[BrokerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Consumes delivery requests from one queue.
pub struct QueueConsumer {
    config: Arc<WorkflowConfig>,
    broker: Arc<dyn QueueBroker>,
    dispatcher: Arc<DeliveryDispatcher>,
    state: ArcSwap<ConsumerState>,
    active: tokio::sync::Mutex<Option<Arc<dyn Subscription>>>,
}

impl QueueConsumer {
    #[must_use]
    pub fn new(
        config: Arc<WorkflowConfig>,
        broker: Arc<dyn QueueBroker>,
        processor: Arc<dyn RequestProcessor>,
    ) -> Self {
        let pipeline = build_processor_pipeline(processor, config.processing_timeout);
        Self {
            config,
            broker,
            dispatcher: Arc::new(DeliveryDispatcher::new(pipeline, InFlightTracker::new())),
            state: ArcSwap::from_pointee(ConsumerState::Stopped),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        **self.state.load()
    }

    /// Number of messages currently being dispatched.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.dispatcher.in_flight().count()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(Arc::new(state));
    }

    fn queue_name(&self) -> &str {
        &self.config.queue.queue_name
    }

    /// Subscribes to the queue and begins delivery. Returns once the
    /// subscription is actively receiving.
    ///
    /// Calling `start` on a running consumer is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Subscribe`] or [`ConsumerError::StartProcessing`]
    /// when the subscription cannot be acquired; the consumer is left stopped.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut active = self.active.lock().await;
        if active.is_some() && self.state() == ConsumerState::Running {
            return Ok(());
        }
        let queue = self.queue_name();
        // An interrupted start leaves a subscription that never began processing.
        if let Some(stale) = active.take() {
            if let Err(e) = stale.close().await {
                warn!(queue, stage = "close", error = %e, "cannot release subscription from interrupted start");
            }
        }
        self.set_state(ConsumerState::Starting);

        let options = SubscriptionOptions {
            max_concurrent_calls: self.config.max_concurrent_calls,
        };
        let subscription = match self.broker.subscribe(queue, options).await {
            Ok(subscription) => subscription,
            Err(source) => {
                self.set_state(ConsumerState::Stopped);
                error!(queue, stage = "subscribe", error = %source, "cannot subscribe to queue");
                return Err(ConsumerError::Subscribe {
                    queue: queue.to_string(),
                    source,
                });
            }
        };

        // Held before the first await on it, so a dropped `start` future still
        // leaves the subscription where `stop` can release it.
        *active = Some(Arc::clone(&subscription));
        subscription.set_message_handler(Arc::clone(&self.dispatcher) as _);
        subscription.set_error_handler(Arc::new(BrokerErrorLogger));

        if let Err(source) = subscription.start_processing().await {
            *active = None;
            if let Err(e) = subscription.close().await {
                warn!(queue, stage = "close", error = %e, "cannot release subscription after failed start");
            }
            self.set_state(ConsumerState::Stopped);
            error!(queue, stage = "start", error = %source, "cannot start message processing");
            return Err(ConsumerError::StartProcessing {
                queue: queue.to_string(),
                source,
            });
        }

        self.set_state(ConsumerState::Running);
        info!(
            queue,
            namespace = self.broker.fully_qualified_namespace(),
            max_concurrent_calls = self.config.max_concurrent_calls,
            "consumer started"
        );
        Ok(())
    }

    /// Stops the consumer, waiting up to the configured drain timeout for
    /// in-flight dispatches.
    ///
    /// # Errors
    ///
    /// See [`QueueConsumer::stop_with_drain`].
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        self.stop_with_drain(self.config.drain_timeout).await
    }

    /// Stops accepting deliveries, waits up to `drain_timeout` for in-flight
    /// dispatches, then releases the subscription.
    ///
    /// A no-op when no subscription is held. A subscription left behind by an
    /// interrupted `start` is released here too. Every cleanup step runs even
    /// if an earlier one fails.
    ///
    /// Dispatches are counted from the moment the handler runs, so a message
    /// the broker handed off just before `stop_processing` may not be waited
    /// for. Its settlement then fails against the closed subscription and the
    /// broker redelivers it.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Stop`] with every broker error encountered.
    pub async fn stop_with_drain(&self, drain_timeout: Duration) -> Result<(), ConsumerError> {
        let mut active = self.active.lock().await;
        let Some(subscription) = active.take() else {
            return Ok(());
        };
        self.set_state(ConsumerState::Stopping);
        let queue = self.queue_name();
        let mut errors = Vec::new();

        if let Err(e) = subscription.stop_processing().await {
            warn!(queue, stage = "stop_processing", error = %e, "error stopping deliveries");
            errors.push(e);
        }

        let in_flight = self.dispatcher.in_flight();
        if !in_flight.wait_for_drain(drain_timeout).await {
            warn!(
                queue,
                in_flight = in_flight.count(),
                timeout_ms = u64::try_from(drain_timeout.as_millis()).unwrap_or(u64::MAX),
                "drain timeout expired, releasing subscription with dispatches in flight"
            );
        }

        if let Err(e) = subscription.close().await {
            warn!(queue, stage = "close", error = %e, "error closing subscription");
            errors.push(e);
        }

        self.set_state(ConsumerState::Stopped);
        info!(queue, "consumer stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConsumerError::Stop {
                queue: queue.to_string(),
                errors,
            })
        }
    }
}
