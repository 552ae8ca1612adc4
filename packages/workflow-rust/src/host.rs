use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// HostedService trait
// ---------------------------------------------------------------------------

/// Long-running service driven by a [`Host`].
///
/// Services are started in registration order and stopped in reverse
/// registration order. `stop` may be called on a service that never started
/// and must then succeed without doing anything.
#[async_trait]
pub trait HostedService: Send + Sync {
    /// Returns the name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Starts the service. Must not return `Ok` until the service is running.
    async fn start(&self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Stops the service. A cancelled token asks for a fast, non-graceful stop.
    async fn stop(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Runs a set of hosted services.
#[derive(Default)]
pub struct Host {
    services: RwLock<Vec<Arc<dyn HostedService>>>,
}

impl Host {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service. Registration order determines start/stop sequencing.
    pub fn register(&self, service: Arc<dyn HostedService>) {
        self.services.write().push(service);
    }

    /// Starts all services in registration order.
    ///
    /// When a service fails to start, the services already started are stopped
    /// in reverse order before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first start failure, annotated with the service name.
    pub async fn start_all(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let services = self.services.read().clone();
        for (index, service) in services.iter().enumerate() {
            if let Err(e) = service.start(cancel).await {
                error!(service = service.name(), error = %format!("{e:#}"), "service failed to start");
                for started in services[..index].iter().rev() {
                    if let Err(stop_err) = started.stop(cancel).await {
                        error!(
                            service = started.name(),
                            error = %format!("{stop_err:#}"),
                            "rollback stop failed"
                        );
                    }
                }
                return Err(e.context(format!("starting service {}", service.name())));
            }
            info!(service = service.name(), "service started");
        }
        Ok(())
    }

    /// Stops all services in reverse registration order, attempting every
    /// service even when some fail.
    ///
    /// # Errors
    ///
    /// Returns an error naming every service whose stop failed.
    pub async fn stop_all(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let services = self.services.read().clone();
        let mut failures = Vec::new();
        for service in services.iter().rev() {
            match service.stop(cancel).await {
                Ok(()) => info!(service = service.name(), "service stopped"),
                Err(e) => {
                    error!(service = service.name(), error = %format!("{e:#}"), "service failed to stop");
                    failures.push(format!("{}: {e:#}", service.name()));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} service(s) failed to stop: {}",
                failures.len(),
                failures.join("; ")
            ))
        }
    }

    /// Starts every service, waits for `shutdown` to resolve, then stops
    /// every service.
    ///
    /// # Errors
    ///
    /// Returns start failures, shutdown-signal failures and stop failures.
    pub async fn run_until<F, E>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = Result<(), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        self.start_all(&cancel).await?;
        let signalled = shutdown.await.context("waiting for shutdown signal");
        info!("shutdown requested");
        let stopped = self.stop_all(&cancel).await;
        signalled?;
        stopped
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
