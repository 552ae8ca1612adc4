//! [`DashMap`]-backed collaborators.
//!
//! Concurrent callers with distinct keys never contend on a shared lock;
//! `DashMap` shards internally. Deliveries are kept as JSON documents, the
//! way a document database would hold them.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dronedelivery_core::{DeliveryRequest, PackageInfo};

use crate::traits::{
    DeliveryRepository, DroneScheduler, PackageRegistry, RepositoryError, ScheduledDelivery,
};

// ---------------------------------------------------------------------------
// InMemoryDeliveryRepository
// ---------------------------------------------------------------------------

/// Delivery documents keyed by `(partition_key, id)`.
#[derive(Default)]
pub struct InMemoryDeliveryRepository {
    documents: DashMap<(String, String), serde_json::Value>,
}

impl InMemoryDeliveryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DeliveryRepository for InMemoryDeliveryRepository {
    async fn get(
        &self,
        id: &str,
        partition_key: &str,
    ) -> Result<Option<ScheduledDelivery>, RepositoryError> {
        let Some(document) = self
            .documents
            .get(&(partition_key.to_string(), id.to_string()))
            .map(|entry| entry.value().clone())
        else {
            return Ok(None);
        };
        let delivery = serde_json::from_value(document)
            .with_context(|| format!("corrupt delivery document {id}"))?;
        Ok(Some(delivery))
    }

    async fn create(&self, delivery: ScheduledDelivery) -> Result<(), RepositoryError> {
        let document = serde_json::to_value(&delivery)
            .with_context(|| format!("serializing delivery {}", delivery.id))?;
        let key = (delivery.partition_key.clone(), delivery.id.clone());
        match self.documents.entry(key) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict {
                id: delivery.id,
                partition_key: delivery.partition_key,
            }),
            Entry::Vacant(slot) => {
                slot.insert(document);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryPackageRegistry
// ---------------------------------------------------------------------------

/// Package records keyed by package id. Upserts replace.
#[derive(Default)]
pub struct InMemoryPackageRegistry {
    packages: DashMap<String, PackageInfo>,
}

impl InMemoryPackageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, package_id: &str) -> Option<PackageInfo> {
        self.packages.get(package_id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl PackageRegistry for InMemoryPackageRegistry {
    async fn upsert(&self, package: &PackageInfo) -> anyhow::Result<()> {
        self.packages
            .insert(package.package_id.clone(), package.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FleetScheduler
// ---------------------------------------------------------------------------

/// Assigns drones from a fixed fleet in round-robin order.
///
/// An empty fleet never assigns a drone.
pub struct FleetScheduler {
    drones: Vec<String>,
    next: AtomicUsize,
}

impl FleetScheduler {
    #[must_use]
    pub fn new<I, S>(drones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            drones: drones.into_iter().map(Into::into).collect(),
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DroneScheduler for FleetScheduler {
    async fn assign_drone(&self, _request: &DeliveryRequest) -> anyhow::Result<Option<String>> {
        if self.drones.is_empty() {
            return Ok(None);
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.drones.len();
        Ok(Some(self.drones[slot].clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
