//! Error types for the relay pipeline.

use crate::lock::LockState;
use queue_runtime::{QueueError, QueueName};

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

/// Failure of a single message pipeline
///
/// Every variant is recovered by abandoning the source message.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Inbound message could not be translated: {message}")]
    Translation { message: String },

    #[error("Failed to send message to destination: {0}")]
    Delivery(#[source] QueueError),

    #[error("Failed to acknowledge source message: {0}")]
    Acknowledgment(#[from] AcknowledgmentError),
}

impl RelayError {
    /// Check if a later redelivery has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Translation { .. } => false,
            Self::Delivery(error) => error.is_transient(),
            Self::Acknowledgment(error) => error.is_transient(),
        }
    }
}

/// Failure applying an outcome to a message lock
#[derive(Debug, thiserror::Error)]
pub enum AcknowledgmentError {
    #[error("Message lock is no longer active (state: {state})")]
    NotActive { state: LockState },

    #[error("Message lock expired before an outcome was applied")]
    LockExpired,

    #[error("Queue provider rejected the acknowledgment: {0}")]
    Provider(#[source] QueueError),
}

impl AcknowledgmentError {
    /// Check if the failure is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotActive { .. } | Self::LockExpired => false,
            Self::Provider(error) => error.is_transient(),
        }
    }
}

/// Fault raised by the source outside any message pipeline
#[derive(Debug, thiserror::Error)]
#[error("Receive from '{queue}' failed: {error}")]
pub struct ConnectionFault {
    pub queue: QueueName,
    #[source]
    pub error: QueueError,
}

impl ConnectionFault {
    pub fn new(queue: QueueName, error: QueueError) -> Self {
        Self { queue, error }
    }
}
