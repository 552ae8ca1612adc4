use serde::{Deserialize, Serialize};

/// A request to deliver one package, as published by the ingestion service.
///
/// Decoded once from the message body and treated as immutable afterwards.
/// Field names follow the upstream JSON contract (camelCase). Unknown fields
/// are ignored so producers can add metadata without breaking consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    /// Unique identifier of the delivery. Also the source of the partition key.
    pub delivery_id: String,
    /// Account that placed the order.
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub pickup_location: String,
    #[serde(default)]
    pub drop_off_location: String,
    /// Requested pickup time. Kept as the producer's string representation.
    #[serde(default)]
    pub pickup_time: String,
    #[serde(default)]
    pub deadline: String,
    #[serde(default)]
    pub expedited: bool,
    #[serde(default)]
    pub confirmation_required: ConfirmationRequired,
    /// The package to be delivered. Required by the workflow, optional on the wire.
    #[serde(default)]
    pub package_info: Option<PackageInfo>,
}

impl DeliveryRequest {
    /// Creates a request with only the identifier set.
    #[must_use]
    pub fn new(delivery_id: impl Into<String>) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            owner_id: String::new(),
            pickup_location: String::new(),
            drop_off_location: String::new(),
            pickup_time: String::new(),
            deadline: String::new(),
            expedited: false,
            confirmation_required: ConfirmationRequired::None,
            package_info: None,
        }
    }

    /// Attaches package information.
    #[must_use]
    pub fn with_package(mut self, package: PackageInfo) -> Self {
        self.package_info = Some(package);
        self
    }
}

/// Description of the package carried by a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub package_id: String,
    #[serde(default)]
    pub size: PackageSize,
    /// Weight in kilograms.
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageSize {
    #[default]
    Small,
    Medium,
    Large,
}

/// Proof of delivery the recipient has to provide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationRequired {
    #[default]
    None,
    FingerPrint,
    Signature,
    Picture,
    Age,
}
