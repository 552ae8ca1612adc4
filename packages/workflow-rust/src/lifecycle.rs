//! Lifecycle controller binding the queue consumer to the host contract.
//!
//! `start` creates the broker client, subscribes, and returns only once
//! messages are being received. `stop` releases the consumer and the broker
//! client independently, so a failure in one never leaks the other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{BrokerError, InMemoryBroker, QueueBroker};
use crate::config::WorkflowConfig;
use crate::consumer::{ConsumerError, ConsumerState, QueueConsumer};
use crate::host::HostedService;
use crate::processor::RequestProcessor;

/// Creates a broker client from the service configuration.
pub type BrokerFactory =
    Arc<dyn Fn(&WorkflowConfig) -> Result<Arc<dyn QueueBroker>, BrokerError> + Send + Sync>;

/// Factory handing out a shared in-process broker, declaring the configured
/// queue on it.
///
/// Every client it returns is the same broker, so the close issued by
/// [`WorkflowService::stop`] or by a failed `start` closes it for good. A
/// service built on this factory cannot be started again after that; build a
/// new broker and factory instead.
#[must_use]
pub fn in_memory_factory(broker: Arc<InMemoryBroker>) -> BrokerFactory {
    Arc::new(move |config: &WorkflowConfig| -> Result<Arc<dyn QueueBroker>, BrokerError> {
        broker.declare_queue(&config.queue.queue_name);
        Ok(Arc::clone(&broker) as Arc<dyn QueueBroker>)
    })
}

/// Errors surfaced by [`WorkflowService`].
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("start cancelled")]
    Cancelled,
    #[error("cannot create broker client: {0}")]
    Connect(#[source] BrokerError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error("{}", describe_stop(.consumer.as_ref(), .client.as_ref()))]
    Stop {
        consumer: Option<ConsumerError>,
        client: Option<BrokerError>,
    },
}

fn describe_stop(consumer: Option<&ConsumerError>, client: Option<&BrokerError>) -> String {
    let mut parts = Vec::new();
    if let Some(e) = consumer {
        parts.push(format!("consumer: {e}"));
    }
    if let Some(e) = client {
        parts.push(format!("broker client: {e}"));
    }
    format!("stop failed ({})", parts.join("; "))
}

struct Running {
    broker: Arc<dyn QueueBroker>,
    consumer: QueueConsumer,
}

/// The delivery workflow service.
pub struct WorkflowService {
    config: Arc<WorkflowConfig>,
    processor: Arc<dyn RequestProcessor>,
    broker_factory: BrokerFactory,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl WorkflowService {
    #[must_use]
    pub fn new(
        config: Arc<WorkflowConfig>,
        processor: Arc<dyn RequestProcessor>,
        broker_factory: BrokerFactory,
    ) -> Self {
        Self {
            config,
            processor,
            broker_factory,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// State of the underlying consumer; `Stopped` when not started.
    pub async fn consumer_state(&self) -> ConsumerState {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(ConsumerState::Stopped, |running| running.consumer.state())
    }

    /// Connects and starts consuming. A no-op when already started.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Cancelled`] when `cancel` fires before the
    /// subscription is active, [`LifecycleError::Connect`] when the broker
    /// client cannot be created and [`LifecycleError::Consumer`] when the
    /// subscription cannot be acquired. Nothing is left running on error.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }

        let broker = (self.broker_factory)(&self.config).map_err(LifecycleError::Connect)?;
        let consumer = QueueConsumer::new(
            Arc::clone(&self.config),
            Arc::clone(&broker),
            Arc::clone(&self.processor),
        );

        let started = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LifecycleError::Cancelled),
            result = consumer.start() => result.map_err(LifecycleError::from),
        };
        if let Err(e) = started {
            if let Err(stop_err) = consumer.stop_with_drain(Duration::ZERO).await {
                warn!(error = %stop_err, "cannot release consumer after failed start");
            }
            if let Err(close_err) = broker.close().await {
                warn!(error = %close_err, "cannot close broker client after failed start");
            }
            return Err(e);
        }

        *running = Some(Running { broker, consumer });
        info!(queue = %self.config.queue.queue_name, "workflow service started");
        Ok(())
    }

    /// Stops consuming and closes the broker client. A no-op when not started.
    ///
    /// A cancelled `cancel` token skips waiting for in-flight dispatches.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Stop`] carrying every failure; both resources
    /// are released regardless.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let Some(Running { broker, consumer }) = self.running.lock().await.take() else {
            return Ok(());
        };
        let drain = if cancel.is_cancelled() {
            Duration::ZERO
        } else {
            self.config.drain_timeout
        };

        let consumer_err = consumer.stop_with_drain(drain).await.err();
        let client_err = broker.close().await.err();
        info!(queue = %self.config.queue.queue_name, "workflow service stopped");

        if consumer_err.is_none() && client_err.is_none() {
            Ok(())
        } else {
            Err(LifecycleError::Stop {
                consumer: consumer_err,
                client: client_err,
            })
        }
    }
}

#[async_trait]
impl HostedService for WorkflowService {
    fn name(&self) -> &'static str {
        "workflow"
    }

    async fn start(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(Self::start(self, cancel).await?)
    }

    async fn stop(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(Self::stop(self, cancel).await?)
    }
}
