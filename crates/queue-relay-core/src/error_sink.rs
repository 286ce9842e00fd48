//! Sink for faults that belong to no particular message.

use crate::error::ConnectionFault;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

#[cfg(test)]
#[path = "error_sink_tests.rs"]
mod tests;

/// Receiver of delivery-layer faults raised outside a message pipeline
///
/// Implementations must return promptly and must not panic. Reporting a
/// fault never stops or restarts the relay loop.
pub trait ErrorSink: Send + Sync {
    fn on_delivery_error(&self, fault: &ConnectionFault);
}

/// Error sink that logs each fault and keeps a running count
#[derive(Debug, Default)]
pub struct TracingErrorSink {
    faults: AtomicU64,
}

impl TracingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of faults reported so far
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

impl ErrorSink for TracingErrorSink {
    fn on_delivery_error(&self, fault: &ConnectionFault) {
        let total = self.faults.fetch_add(1, Ordering::Relaxed) + 1;
        error!(
            queue = %fault.queue,
            error = %fault.error,
            transient = fault.error.is_transient(),
            total_faults = total,
            "Delivery fault outside message processing"
        );
    }
}
