//! Drone delivery core: delivery request model, message envelope, and payload codec.

pub mod codec;
pub mod disposition;
pub mod message;
pub mod properties;
pub mod types;

pub use codec::{decode, encode, DecodeError};
pub use disposition::{DeadLetterReason, Disposition};
pub use message::{LockToken, ReceivedMessage};
pub use properties::{ApplicationProperties, PropertyValue};
pub use types::{ConfirmationRequired, DeliveryRequest, PackageInfo, PackageSize};
