//! Timeout middleware for the processor pipeline.
//!
//! A processor call that outlives the configured duration is abandoned and
//! reported as a [`ProcessError::Fault`], which dead-letters the message.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use crate::processor::{ProcessError, ProcessRequest};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that bounds how long a single processor call may run.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces the processing timeout.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<ProcessRequest> for TimeoutService<S>
where
    S: Service<ProcessRequest, Response = (), Error = ProcessError> + Send,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = ProcessError;
    type Future = Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ProcessRequest) -> Self::Future {
        let timeout = self.timeout;
        let delivery_id = req.request.delivery_id.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(ProcessError::Fault(anyhow::anyhow!(
                    "processing delivery {delivery_id} timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dronedelivery_core::{ApplicationProperties, DeliveryRequest};
    use tower::ServiceExt;

    use super::*;

    /// Service that takes a configurable delay before responding.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<ProcessRequest> for SlowService {
        type Response = ();
        type Error = ProcessError;
        type Future = Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: ProcessRequest) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(())
            })
        }
    }

    fn make_req() -> ProcessRequest {
        ProcessRequest {
            message_id: "m-1".to_string(),
            request: Arc::new(DeliveryRequest::new("D1")),
            properties: Arc::new(ApplicationProperties::new()),
        }
    }

    #[tokio::test]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer::new(Duration::from_millis(1000)).layer(SlowService { delay_ms: 10 });
        svc.oneshot(make_req()).await.unwrap();
    }

    #[tokio::test]
    async fn exceeds_timeout_returns_fault() {
        let svc = TimeoutLayer::new(Duration::from_millis(50)).layer(SlowService { delay_ms: 200 });
        let err = svc.oneshot(make_req()).await.unwrap_err();
        assert!(matches!(err, ProcessError::Fault(_)));
        assert!(err.to_string().contains("D1 timed out after 50ms"));
    }
}
