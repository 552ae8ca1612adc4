//! Drone delivery workflow service: consumes delivery requests from a durable
//! queue, schedules them, and routes every message to completion or to the
//! dead-letter queue.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod host;
pub mod lifecycle;
pub mod logging;
pub mod processor;
pub mod storage;
pub mod traits;

pub use broker::{BrokerError, InMemoryBroker, QueueBroker};
pub use config::{ConfigError, QueueConfig, WorkflowArgs, WorkflowConfig};
pub use consumer::{ConsumerError, ConsumerState, QueueConsumer};
pub use host::{Host, HostedService};
pub use lifecycle::{in_memory_factory, BrokerFactory, LifecycleError, WorkflowService};
pub use logging::{init_tracing, LogFormat};
pub use processor::{processor_fn, ProcessError, RequestProcessor, WorkflowProcessor};
pub use traits::{DeliveryRepository, DroneScheduler, PackageRegistry, ScheduledDelivery};
