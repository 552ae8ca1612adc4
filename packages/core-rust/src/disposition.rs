//! Terminal outcomes of a single processing attempt.

use std::fmt;

/// Why a message was routed to the dead-letter queue by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// The body could not be decoded into a delivery request.
    UnparseablePayload,
    /// The processor declined the request on business grounds.
    ProcessingRejected,
    /// The processor failed unexpectedly (error, timeout or panic).
    ProcessingFailed,
}

impl DeadLetterReason {
    /// Stable reason string recorded on the dead-lettered message.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnparseablePayload => "UnparseablePayload",
            Self::ProcessingRejected => "ProcessingRejected",
            Self::ProcessingFailed => "ProcessingFailed",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one processing attempt.
///
/// Exactly one of these is produced per delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Processed successfully and removed from the active queue.
    Completed,
    /// Moved to the dead-letter queue.
    DeadLettered(DeadLetterReason),
    /// Settlement itself failed; the broker's redelivery policy applies.
    Unresolved,
}

impl Disposition {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::DeadLettered(_) => "dead_lettered",
            Self::Unresolved => "unresolved",
        }
    }

    /// True for `Completed` and `DeadLettered`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}
