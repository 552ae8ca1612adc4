//! The delivery scheduling workflow.
//!
//! For every request: skip it if it was already scheduled, validate it,
//! register its package, obtain a drone, and persist the scheduled delivery.
//! Business-rule violations are rejections; collaborator failures are faults.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use dronedelivery_core::{ApplicationProperties, DeliveryRequest, PackageInfo};
use tracing::{debug, info};

use super::{ProcessError, RequestProcessor};
use crate::storage::partition_key;
use crate::traits::{
    DeliveryRepository, DroneScheduler, PackageRegistry, RepositoryError, ScheduledDelivery,
};

/// Schedules delivery requests against the package, drone and delivery services.
pub struct WorkflowProcessor {
    deliveries: Arc<dyn DeliveryRepository>,
    packages: Arc<dyn PackageRegistry>,
    drones: Arc<dyn DroneScheduler>,
    partition_key_len: usize,
}

impl WorkflowProcessor {
    #[must_use]
    pub fn new(
        deliveries: Arc<dyn DeliveryRepository>,
        packages: Arc<dyn PackageRegistry>,
        drones: Arc<dyn DroneScheduler>,
        partition_key_len: usize,
    ) -> Self {
        Self {
            deliveries,
            packages,
            drones,
            partition_key_len,
        }
    }
}

/// Checks the business rules a request must satisfy before it is scheduled.
fn validate(request: &DeliveryRequest) -> Result<&PackageInfo, ProcessError> {
    if request.delivery_id.trim().is_empty() {
        return Err(ProcessError::rejected("delivery id is empty"));
    }
    let package = request
        .package_info
        .as_ref()
        .ok_or_else(|| ProcessError::rejected("delivery has no package information"))?;
    if package.package_id.trim().is_empty() {
        return Err(ProcessError::rejected("package id is empty"));
    }
    if !(package.weight.is_finite() && package.weight > 0.0) {
        return Err(ProcessError::rejected(format!(
            "package {} has invalid weight {}",
            package.package_id, package.weight
        )));
    }
    Ok(package)
}

#[async_trait]
impl RequestProcessor for WorkflowProcessor {
    async fn process(
        &self,
        request: &DeliveryRequest,
        properties: &ApplicationProperties,
    ) -> Result<(), ProcessError> {
        let delivery_id = request.delivery_id.as_str();
        let partition = partition_key(delivery_id, self.partition_key_len);

        let existing = self
            .deliveries
            .get(delivery_id, &partition)
            .await
            .with_context(|| format!("loading delivery {delivery_id}"))?;
        if existing.is_some() {
            info!(delivery_id, "delivery already scheduled, skipping");
            return Ok(());
        }

        let package = validate(request)?;

        self.packages
            .upsert(package)
            .await
            .with_context(|| format!("upserting package {}", package.package_id))?;

        let drone_id = self
            .drones
            .assign_drone(request)
            .await
            .with_context(|| format!("assigning drone for delivery {delivery_id}"))?
            .ok_or_else(|| {
                ProcessError::rejected(format!("no drone available for delivery {delivery_id}"))
            })?;
        debug!(delivery_id, drone_id = %drone_id, "drone assigned");

        let scheduled = ScheduledDelivery {
            id: request.delivery_id.clone(),
            partition_key: partition,
            owner_id: request.owner_id.clone(),
            pickup_location: request.pickup_location.clone(),
            drop_off_location: request.drop_off_location.clone(),
            deadline: request.deadline.clone(),
            expedited: request.expedited,
            confirmation_required: request.confirmation_required,
            package_id: package.package_id.clone(),
            drone_id,
        };

        match self.deliveries.create(scheduled).await {
            Ok(()) => {}
            // A concurrent delivery attempt of the same request won the insert.
            Err(RepositoryError::Conflict { .. }) => {
                info!(delivery_id, "delivery scheduled concurrently, skipping");
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("storing delivery {delivery_id}"))
                    .into())
            }
        }

        info!(
            delivery_id,
            correlation_id = properties.correlation_id().unwrap_or(""),
            "delivery scheduled"
        );
        Ok(())
    }
}
