//! In-memory implementations of the workflow's downstream collaborators.
//!
//! - [`InMemoryDeliveryRepository`]: delivery documents keyed by partition and id
//! - [`InMemoryPackageRegistry`]: package records keyed by package id
//! - [`FleetScheduler`]: round-robin drone assignment over a fixed fleet

pub mod memory;

pub use memory::{FleetScheduler, InMemoryDeliveryRepository, InMemoryPackageRegistry};

/// Derives the partition key for a delivery id: its first `len` characters,
/// or the whole id when it is shorter.
#[must_use]
pub fn partition_key(delivery_id: &str, len: usize) -> String {
    delivery_id.chars().take(len).collect()
}
