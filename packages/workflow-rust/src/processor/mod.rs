//! Request processing seam.
//!
//! The consumer hands every decoded delivery request to a [`RequestProcessor`].
//! Processors report success as `Ok(())`; a business-rule rejection and an
//! unexpected failure are both errors, distinguished by [`ProcessError`].
//!
//! Calls go through a tower pipeline (see [`middleware`]) that adds timing,
//! outcome logging and a processing timeout around the processor.

pub mod middleware;
pub mod workflow;

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dronedelivery_core::{ApplicationProperties, DeliveryRequest};
use futures_util::FutureExt;
use tower::Service;

pub use middleware::{build_processor_pipeline, ProcessorPipeline};
pub use workflow::WorkflowProcessor;

// ---------------------------------------------------------------------------
// ProcessError
// ---------------------------------------------------------------------------

/// Why a delivery request was not handled.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The request was understood but declined by business rules.
    #[error("request rejected: {reason}")]
    Rejected { reason: String },
    /// Processing failed unexpectedly.
    #[error("processing failed: {0:#}")]
    Fault(#[from] anyhow::Error),
}

impl ProcessError {
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

// ---------------------------------------------------------------------------
// RequestProcessor
// ---------------------------------------------------------------------------

/// Business logic invoked once per decoded delivery request.
///
/// Invoked concurrently for different requests, so implementations and the
/// stores behind them must tolerate parallel calls with distinct delivery ids.
/// `Ok(())` means the request was durably handled and never needs to be
/// processed again.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process(
        &self,
        request: &DeliveryRequest,
        properties: &ApplicationProperties,
    ) -> Result<(), ProcessError>;
}

#[async_trait]
impl<P: RequestProcessor + ?Sized> RequestProcessor for Arc<P> {
    async fn process(
        &self,
        request: &DeliveryRequest,
        properties: &ApplicationProperties,
    ) -> Result<(), ProcessError> {
        (**self).process(request, properties).await
    }
}

/// Processor backed by an async closure. Built by [`processor_fn`].
pub struct FnProcessor<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure as a [`RequestProcessor`].
///
/// The closure receives owned copies of the request and properties.
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F, Fut>
where
    F: Fn(DeliveryRequest, ApplicationProperties) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessError>> + Send,
{
    FnProcessor {
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> RequestProcessor for FnProcessor<F, Fut>
where
    F: Fn(DeliveryRequest, ApplicationProperties) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessError>> + Send,
{
    async fn process(
        &self,
        request: &DeliveryRequest,
        properties: &ApplicationProperties,
    ) -> Result<(), ProcessError> {
        (self.f)(request.clone(), properties.clone()).await
    }
}

// ---------------------------------------------------------------------------
// ProcessRequest / ProcessorService
// ---------------------------------------------------------------------------

/// One invocation of the processor as it flows through the pipeline.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub message_id: String,
    pub request: Arc<DeliveryRequest>,
    pub properties: Arc<ApplicationProperties>,
}

/// Innermost pipeline service: calls the processor and turns a panic into a
/// [`ProcessError::Fault`].
#[derive(Clone)]
pub struct ProcessorService {
    processor: Arc<dyn RequestProcessor>,
}

impl ProcessorService {
    #[must_use]
    pub fn new(processor: Arc<dyn RequestProcessor>) -> Self {
        Self { processor }
    }
}

impl Service<ProcessRequest> for ProcessorService {
    type Response = ();
    type Error = ProcessError;
    type Future = Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ProcessRequest) -> Self::Future {
        let processor = Arc::clone(&self.processor);
        Box::pin(async move {
            let fut = async move { processor.process(&req.request, &req.properties).await };
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    Err(ProcessError::Fault(anyhow::anyhow!(
                        "processor panicked: {detail}"
                    )))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;

    fn make_req(id: &str) -> ProcessRequest {
        ProcessRequest {
            message_id: format!("msg-{id}"),
            request: Arc::new(DeliveryRequest::new(id)),
            properties: Arc::new(ApplicationProperties::new()),
        }
    }

    #[tokio::test]
    async fn fn_processor_receives_request_and_properties() {
        let processor = processor_fn(|request, properties| async move {
            assert_eq!(request.delivery_id, "D1");
            assert_eq!(properties.correlation_id(), Some("c-1"));
            Ok(())
        });
        let props = ApplicationProperties::new().with("correlationId", "c-1");
        processor
            .process(&DeliveryRequest::new("D1"), &props)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn service_passes_through_rejection() {
        let processor: Arc<dyn RequestProcessor> = Arc::new(processor_fn(|_, _| async {
            Err(ProcessError::rejected("no drones"))
        }));
        let err = ProcessorService::new(processor)
            .oneshot(make_req("D1"))
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), "request rejected: no drones");
    }

    #[tokio::test]
    async fn service_converts_panic_into_fault() {
        let processor: Arc<dyn RequestProcessor> = Arc::new(processor_fn(|request, _| async move {
            if request.delivery_id == "D9" {
                panic!("unexpected delivery");
            }
            Ok(())
        }));
        let err = ProcessorService::new(processor)
            .oneshot(make_req("D9"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Fault(_)));
        assert!(err.to_string().contains("unexpected delivery"));
    }

    #[test]
    fn fault_display_includes_cause_chain() {
        let err = ProcessError::from(
            anyhow::anyhow!("connection reset").context("storing delivery D2"),
        );
        assert_eq!(
            err.to_string(),
            "processing failed: storing delivery D2: connection reset"
        );
    }
}
