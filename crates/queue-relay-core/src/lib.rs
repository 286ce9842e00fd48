//! # Queue Relay Core
//!
//! Moves messages from an error (dead-letter) queue back to the queue they
//! came from, with at-least-once delivery and explicit acknowledgment.
//!
//! Each received message flows through one pipeline:
//!
//! 1. the [`translator`] rebuilds it as an outbound message,
//! 2. the [`relay`] sends it to the destination queue,
//! 3. the [`lock`] controller completes the source message on success or
//!    abandons it on failure, renewing its lock lease while the pipeline runs.
//!
//! Faults that belong to no particular message are reported to an
//! [`error_sink::ErrorSink`] and never stop the loop.

pub mod config;
pub mod error;
pub mod error_sink;
pub mod lock;
pub mod relay;
pub mod translator;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, RelayConfig, SecretString};
pub use error::{AcknowledgmentError, ConnectionFault, RelayError};
pub use error_sink::{ErrorSink, TracingErrorSink};
pub use lock::{LockRenewalPolicy, LockState, MessageLock};
pub use relay::{DeliveryOutcome, Relay, RelayOptions, RelayReport};
pub use translator::translate;
