//! Runs the delivery workflow against an in-process queue.

use std::sync::Arc;

use clap::Parser;
use dronedelivery_workflow::storage::{
    FleetScheduler, InMemoryDeliveryRepository, InMemoryPackageRegistry,
};
use dronedelivery_workflow::{
    in_memory_factory, init_tracing, Host, InMemoryBroker, WorkflowArgs, WorkflowProcessor,
    WorkflowService,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = WorkflowArgs::parse();
    init_tracing(args.log_format)?;
    let config = Arc::new(args.to_config()?);
    info!(config = ?config, "configuration loaded");

    let processor = Arc::new(WorkflowProcessor::new(
        Arc::new(InMemoryDeliveryRepository::new()),
        Arc::new(InMemoryPackageRegistry::new()),
        Arc::new(FleetScheduler::new(args.drone_fleet.iter().cloned())),
        config.partition_key_len,
    ));

    let broker = Arc::new(InMemoryBroker::new(config.queue.namespace()));
    warn!(
        endpoint = %config.queue.endpoint,
        "no external broker client linked, consuming from an in-process queue"
    );

    let host = Host::new();
    host.register(Arc::new(WorkflowService::new(
        Arc::clone(&config),
        processor,
        in_memory_factory(broker),
    )));

    host.run_until(tokio::signal::ctrl_c()).await
}
