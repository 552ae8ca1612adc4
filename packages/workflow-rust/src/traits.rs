use async_trait::async_trait;
use dronedelivery_core::{ConfirmationRequired, DeliveryRequest, PackageInfo};
use serde::{Deserialize, Serialize};

/// A delivery accepted by the workflow and assigned to a drone.
///
/// Serialized in camelCase, the document shape of the delivery store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledDelivery {
    /// Delivery id; unique within its partition.
    pub id: String,
    /// Partition the document lives in, derived from the id.
    pub partition_key: String,
    pub owner_id: String,
    pub pickup_location: String,
    pub drop_off_location: String,
    pub deadline: String,
    pub expedited: bool,
    pub confirmation_required: ConfirmationRequired,
    pub package_id: String,
    pub drone_id: String,
}

/// Errors from a [`DeliveryRepository`].
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("document {id} already exists in partition {partition_key}")]
    Conflict { id: String, partition_key: String },
    #[error("repository backend failed: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Document store for scheduled deliveries, addressed by id and partition key.
/// Implementations: in-memory (tests, local runs); document databases plug in here.
#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    /// Load a delivery by id within a partition.
    async fn get(
        &self,
        id: &str,
        partition_key: &str,
    ) -> Result<Option<ScheduledDelivery>, RepositoryError>;

    /// Insert a new delivery. Fails with `Conflict` if the id already exists
    /// in the partition.
    async fn create(&self, delivery: ScheduledDelivery) -> Result<(), RepositoryError>;
}

/// Package service: records the package carried by a delivery.
#[async_trait]
pub trait PackageRegistry: Send + Sync {
    /// Create or replace the package record.
    async fn upsert(&self, package: &PackageInfo) -> anyhow::Result<()>;
}

/// Drone scheduler: picks a drone for a delivery.
#[async_trait]
pub trait DroneScheduler: Send + Sync {
    /// Returns the assigned drone id, or `None` when no drone can take the delivery.
    async fn assign_drone(&self, request: &DeliveryRequest) -> anyhow::Result<Option<String>>;
}
