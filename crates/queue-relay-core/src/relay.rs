//! # Relay Loop
//!
//! Receives messages from the source (error) queue, forwards each to the
//! destination queue and acknowledges it on the source.
//!
//! Per message, exactly once:
//!
//! 1. log receipt,
//! 2. translate it into an outbound message,
//! 3. send the outbound message to the destination,
//! 4. complete the source message on success,
//! 5. abandon the source message if any of steps 2 to 4 failed.
//!
//! At most [`RelayOptions::max_concurrent_deliveries`] messages are inside
//! that pipeline at a time. A slot is taken before receiving, so no message
//! is ever locked while waiting for a slot, and with a bound of one messages
//! are forwarded in delivery order.

use crate::error::{AcknowledgmentError, ConnectionFault, RelayError};
use crate::error_sink::{ErrorSink, TracingErrorSink};
use crate::lock::{LockRenewalPolicy, MessageLock};
use crate::translator::translate;
use chrono::Duration;
use queue_runtime::{MessageId, QueueClient, QueueName, ReceivedMessage};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;

// ============================================================================
// Options
// ============================================================================

/// Tuning options for the relay loop
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Upper bound on messages processed concurrently; 1 serializes processing
    pub max_concurrent_deliveries: usize,

    /// Long-poll wait for each receive call
    pub receive_timeout: Duration,

    /// Pause after a failed receive when the error suggests no retry delay
    pub receive_error_backoff: Duration,

    /// Lease renewal for messages in flight
    pub lock_renewal: LockRenewalPolicy,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 1,
            receive_timeout: Duration::seconds(30),
            receive_error_backoff: Duration::seconds(5),
            lock_renewal: LockRenewalPolicy::default(),
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of processing one received message
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Forwarded and removed from the source queue
    Completed,

    /// Returned to the source queue after the given failure
    Abandoned(RelayError),

    /// Lease ran out before an outcome was applied; the source redelivers
    Expired,

    /// Relay failed and the abandon failed too; the lease decides what happens
    Faulted(RelayError),
}

impl DeliveryOutcome {
    /// Short label used in status lines
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "forwarded",
            Self::Abandoned(_) => "abandoned",
            Self::Expired => "expired",
            Self::Faulted(_) => "faulted",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Counts of outcomes reached during a relay run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub completed: u64,
    pub abandoned: u64,
    pub expired: u64,
    pub faulted: u64,
    /// Receive failures reported to the error sink
    pub connection_faults: u64,
}

impl RelayReport {
    /// Number of messages that reached an outcome
    pub fn total_messages(&self) -> u64 {
        self.completed + self.abandoned + self.expired + self.faulted
    }
}

impl fmt::Display for RelayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} messages: {} forwarded, {} abandoned, {} expired, {} faulted; {} connection faults",
            self.total_messages(),
            self.completed,
            self.abandoned,
            self.expired,
            self.faulted,
            self.connection_faults
        )
    }
}

#[derive(Debug, Default)]
struct OutcomeCounters {
    completed: AtomicU64,
    abandoned: AtomicU64,
    expired: AtomicU64,
    faulted: AtomicU64,
    connection_faults: AtomicU64,
}

impl OutcomeCounters {
    fn record(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Completed => &self.completed,
            DeliveryOutcome::Abandoned(_) => &self.abandoned,
            DeliveryOutcome::Expired => &self.expired,
            DeliveryOutcome::Faulted(_) => &self.faulted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RelayReport {
        RelayReport {
            completed: self.completed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            connection_faults: self.connection_faults.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Relay
// ============================================================================

/// Relay from a source queue to a destination queue
///
/// Cloning is cheap; clones share the clients and the error sink.
#[derive(Clone)]
pub struct Relay {
    source: Arc<dyn QueueClient>,
    source_queue: QueueName,
    destination: Arc<dyn QueueClient>,
    destination_queue: QueueName,
    error_sink: Arc<dyn ErrorSink>,
    options: RelayOptions,
}

impl Relay {
    /// Create a relay that reports connection faults through tracing
    pub fn new(
        source: Arc<dyn QueueClient>,
        source_queue: QueueName,
        destination: Arc<dyn QueueClient>,
        destination_queue: QueueName,
        options: RelayOptions,
    ) -> Self {
        Self {
            source,
            source_queue,
            destination,
            destination_queue,
            error_sink: Arc::new(TracingErrorSink::new()),
            options,
        }
    }

    /// Replace the error sink
    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = error_sink;
        self
    }

    pub fn source_queue(&self) -> &QueueName {
        &self.source_queue
    }

    pub fn destination_queue(&self) -> &QueueName {
        &self.destination_queue
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Relay messages until `shutdown` is cancelled
    ///
    /// After cancellation no new message is received; messages already in
    /// flight run to an outcome before this returns, and their lock renewal
    /// tasks are finished by then.
    pub async fn run(&self, shutdown: CancellationToken) -> RelayReport {
        let slots = Arc::new(Semaphore::new(self.options.max_concurrent_deliveries.max(1)));
        let pipelines = TaskTracker::new();
        let counters = Arc::new(OutcomeCounters::default());

        info!(
            source = %self.source_queue,
            destination = %self.destination_queue,
            max_concurrent_deliveries = self.options.max_concurrent_deliveries,
            "Relay started"
        );

        loop {
            let slot = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                slot = slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self
                    .source
                    .receive_message(&self.source_queue, self.options.receive_timeout) => received,
            };

            match received {
                Ok(Some(message)) => {
                    let relay = self.clone();
                    let counters = counters.clone();
                    pipelines.spawn(async move {
                        let outcome = relay.process_message(message).await;
                        counters.record(&outcome);
                        drop(slot);
                    });
                }
                Ok(None) => {
                    debug!(queue = %self.source_queue, "No message available");
                }
                Err(error) => {
                    drop(slot);
                    counters.connection_faults.fetch_add(1, Ordering::Relaxed);

                    let backoff = error
                        .retry_after()
                        .unwrap_or(self.options.receive_error_backoff)
                        .to_std()
                        .unwrap_or_default();
                    self.error_sink
                        .on_delivery_error(&ConnectionFault::new(self.source_queue.clone(), error));

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        pipelines.close();
        if !pipelines.is_empty() {
            info!(
                in_flight = pipelines.len(),
                "Stop requested; waiting for in-flight messages"
            );
        }
        pipelines.wait().await;

        let report = counters.snapshot();
        info!(report = %report, "Relay stopped");
        report
    }

    /// Run one received message through the pipeline
    ///
    /// Never fails: every error is converted into a [`DeliveryOutcome`].
    pub async fn process_message(&self, inbound: ReceivedMessage) -> DeliveryOutcome {
        info!(
            message_id = %inbound.message_id,
            delivery_count = inbound.delivery_count,
            queue = %self.source_queue,
            "Received message"
        );

        let lock = MessageLock::acquire(
            self.source.clone(),
            inbound.receipt_handle.clone(),
            &self.options.lock_renewal,
        );
        let outcome = self.relay_locked(&inbound, &lock).await;
        lock.release().await;

        report_outcome(&inbound.message_id, &self.destination_queue, &outcome);
        outcome
    }

    async fn relay_locked(&self, inbound: &ReceivedMessage, lock: &MessageLock) -> DeliveryOutcome {
        let failure = match self.forward(inbound).await {
            Ok(()) => match lock.complete().await {
                Ok(()) => return DeliveryOutcome::Completed,
                Err(AcknowledgmentError::LockExpired) => return DeliveryOutcome::Expired,
                Err(e) => RelayError::Acknowledgment(e),
            },
            Err(e) => e,
        };

        warn!(
            message_id = %inbound.message_id,
            error = %failure,
            transient = failure.is_transient(),
            "Relay failed; abandoning message"
        );

        match lock.abandon().await {
            Ok(()) => DeliveryOutcome::Abandoned(failure),
            Err(AcknowledgmentError::LockExpired) => DeliveryOutcome::Expired,
            Err(e) => {
                error!(
                    message_id = %inbound.message_id,
                    cause = %failure,
                    error = %e,
                    "Failed to abandon message; leaving it to lock expiry"
                );
                DeliveryOutcome::Faulted(RelayError::Acknowledgment(e))
            }
        }
    }

    async fn forward(&self, inbound: &ReceivedMessage) -> Result<(), RelayError> {
        let outbound = translate(inbound);
        self.destination
            .send_message(&self.destination_queue, outbound)
            .await
            .map_err(RelayError::Delivery)?;
        Ok(())
    }
}

/// Emit the status line for a message outcome
fn report_outcome(message_id: &MessageId, destination: &QueueName, outcome: &DeliveryOutcome) {
    match outcome {
        DeliveryOutcome::Completed => info!(
            message_id = %message_id,
            destination = %destination,
            outcome = outcome.label(),
            "Message forwarded"
        ),
        DeliveryOutcome::Abandoned(cause) => warn!(
            message_id = %message_id,
            outcome = outcome.label(),
            error = %cause,
            transient = cause.is_transient(),
            "Message abandoned for redelivery"
        ),
        DeliveryOutcome::Expired => warn!(
            message_id = %message_id,
            outcome = outcome.label(),
            "Message lock expired; source will redeliver"
        ),
        DeliveryOutcome::Faulted(error) => error!(
            message_id = %message_id,
            outcome = outcome.label(),
            error = %error,
            "Message faulted"
        ),
    }
}
