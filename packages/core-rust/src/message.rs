use std::fmt;

use bytes::Bytes;

use crate::properties::ApplicationProperties;

/// Broker-issued handle identifying one delivery attempt of a message.
///
/// A message redelivered after its lock expired carries a new token; only the
/// current token can settle it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as handed to the consumer for one processing attempt.
///
/// Owned by the consumer for the duration of the attempt and never retained
/// after it has been settled.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Identifier assigned by the producer or broker.
    pub message_id: String,
    /// Raw payload bytes.
    pub body: Bytes,
    /// Producer-attached application properties.
    pub properties: ApplicationProperties,
    /// Number of times this message has been delivered, starting at 1.
    pub delivery_count: u32,
    /// Lock held by this delivery attempt.
    pub lock_token: LockToken,
}
