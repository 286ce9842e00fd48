//! # Acknowledgment Controller
//!
//! Tracks the lock a received message holds on its source queue and applies
//! exactly one outcome to it.
//!
//! ```text
//!            complete()            abandon()
//! Completed <---------- Active ------------> Abandoned
//!                         |
//!                         | lease runs out with no outcome applied
//!                         v
//!                      Expired
//! ```
//!
//! While the lock is `Active` a background task renews the lease shortly
//! before it runs out, for at most [`LockRenewalPolicy::max_renewal_duration`]
//! after the message was received. The renewal task never outlives the
//! [`MessageLock`] that started it.

use crate::error::AcknowledgmentError;
use chrono::Duration;
use queue_runtime::{QueueClient, ReceiptHandle};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;

/// Delay before retrying a failed renewal when the error suggests none
const DEFAULT_RENEWAL_RETRY_SECONDS: i64 = 1;

// ============================================================================
// Lock State
// ============================================================================

/// State of a message lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Lock held; an outcome can still be applied
    Active,
    /// Message removed from the source queue
    Completed,
    /// Message returned to the source queue for redelivery
    Abandoned,
    /// Lease ran out before an outcome was applied
    Expired,
}

impl LockState {
    /// Check if no further outcome can be applied
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Completed => write!(f, "Completed"),
            Self::Abandoned => write!(f, "Abandoned"),
            Self::Expired => write!(f, "Expired"),
        }
    }
}

// ============================================================================
// Renewal Policy
// ============================================================================

/// How the lease of an active lock is kept alive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRenewalPolicy {
    /// Time after receipt during which renewals may happen; zero disables renewal
    pub max_renewal_duration: Duration,

    /// Renew this long before the current lease deadline
    pub renew_before: Duration,
}

impl LockRenewalPolicy {
    /// Policy that never renews
    pub fn disabled() -> Self {
        Self {
            max_renewal_duration: Duration::zero(),
            renew_before: Duration::zero(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_renewal_duration > Duration::zero()
    }
}

impl Default for LockRenewalPolicy {
    fn default() -> Self {
        Self {
            max_renewal_duration: Duration::minutes(5),
            renew_before: Duration::seconds(10),
        }
    }
}

// ============================================================================
// Message Lock
// ============================================================================

struct LockInner {
    receipt: ReceiptHandle,
    state: LockState,
}

impl LockInner {
    /// Move an active lock whose lease ran out to `Expired`
    fn observe_expiry(&mut self) {
        if self.state == LockState::Active && self.receipt.is_expired() {
            self.state = LockState::Expired;
        }
    }

    fn ensure_active(&mut self) -> Result<(), AcknowledgmentError> {
        self.observe_expiry();
        match self.state {
            LockState::Active => Ok(()),
            LockState::Expired => Err(AcknowledgmentError::LockExpired),
            state => Err(AcknowledgmentError::NotActive { state }),
        }
    }
}

/// Lock on one received message
///
/// Outcome calls and renewals are serialized, so a renewal never races with
/// `complete` or `abandon` on the same receipt.
pub struct MessageLock {
    client: Arc<dyn QueueClient>,
    inner: Arc<Mutex<LockInner>>,
    renewal: CancellationToken,
    renewal_task: Option<JoinHandle<()>>,
}

impl MessageLock {
    /// Take ownership of a receipt and start renewing its lease per `policy`
    ///
    /// Must be called from within a tokio runtime when renewal is enabled.
    pub fn acquire(
        client: Arc<dyn QueueClient>,
        receipt: ReceiptHandle,
        policy: &LockRenewalPolicy,
    ) -> Self {
        let inner = Arc::new(Mutex::new(LockInner {
            receipt,
            state: LockState::Active,
        }));
        let renewal = CancellationToken::new();

        let renewal_task = policy.is_enabled().then(|| {
            tokio::spawn(renew_lease(
                client.clone(),
                inner.clone(),
                policy.clone(),
                renewal.clone(),
            ))
        });

        Self {
            client,
            inner,
            renewal,
            renewal_task,
        }
    }

    /// Current state, moving to `Expired` if the lease has run out
    pub async fn state(&self) -> LockState {
        let mut inner = self.inner.lock().await;
        inner.observe_expiry();
        inner.state
    }

    /// Receipt with the most recently renewed lease deadline
    pub async fn receipt(&self) -> ReceiptHandle {
        self.inner.lock().await.receipt.clone()
    }

    /// Remove the message from the source queue
    ///
    /// # Errors
    ///
    /// - `NotActive` if an outcome was already applied
    /// - `LockExpired` if the lease ran out, locally or as reported by the source
    /// - `Provider` if the source rejected the call; the lock stays `Active`
    pub async fn complete(&self) -> Result<(), AcknowledgmentError> {
        self.settle(LockState::Completed).await
    }

    /// Return the message to the source queue for redelivery
    ///
    /// On a provider failure renewal stops, so the lease runs out and the
    /// source redelivers the message on its own.
    pub async fn abandon(&self) -> Result<(), AcknowledgmentError> {
        self.settle(LockState::Abandoned).await
    }

    async fn settle(&self, outcome: LockState) -> Result<(), AcknowledgmentError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_active()?;

        let result = match outcome {
            LockState::Completed => self.client.complete_message(&inner.receipt).await,
            _ => self.client.abandon_message(&inner.receipt).await,
        };

        match result {
            Ok(()) => {
                inner.state = outcome;
                self.renewal.cancel();
                Ok(())
            }
            Err(error) if error.is_lock_lost() => {
                inner.state = LockState::Expired;
                self.renewal.cancel();
                Err(AcknowledgmentError::LockExpired)
            }
            Err(error) => {
                if outcome == LockState::Abandoned {
                    self.renewal.cancel();
                }
                Err(AcknowledgmentError::Provider(error))
            }
        }
    }

    /// Stop lease renewal and wait for the renewal task to finish
    pub async fn release(mut self) {
        self.renewal.cancel();
        if let Some(task) = self.renewal_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Lock renewal task did not shut down cleanly");
            }
        }
    }
}

impl Drop for MessageLock {
    fn drop(&mut self) {
        self.renewal.cancel();
    }
}

/// Time to wait before renewing a lease with `remaining` left
///
/// Renews `renew_before` ahead of the deadline, but never sooner than half
/// the remaining lease, so leases no longer than `renew_before` are not
/// renewed back to back.
fn renewal_delay(remaining: Duration, renew_before: Duration) -> std::time::Duration {
    let ahead_of_deadline = remaining - renew_before;
    let half_of_remaining = remaining / 2;
    ahead_of_deadline
        .max(half_of_remaining)
        .to_std()
        .unwrap_or_default()
}

/// Renew the lease until an outcome is applied, the budget is spent, or
/// renewal is cancelled
async fn renew_lease(
    client: Arc<dyn QueueClient>,
    inner: Arc<Mutex<LockInner>>,
    policy: LockRenewalPolicy,
    cancel: CancellationToken,
) {
    let budget_ends = tokio::time::Instant::now()
        + policy.max_renewal_duration.to_std().unwrap_or_default();

    loop {
        let wait = {
            let mut inner = inner.lock().await;
            inner.observe_expiry();
            if inner.state.is_terminal() {
                return;
            }
            renewal_delay(inner.receipt.time_until_expiry(), policy.renew_before)
        };

        let renew_at = tokio::time::Instant::now() + wait;
        if renew_at >= budget_ends {
            debug!("Lock renewal budget exhausted; lease will run out naturally");
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(renew_at) => {}
        }

        let failure = {
            let mut inner = inner.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            inner.observe_expiry();
            if inner.state.is_terminal() {
                return;
            }

            match client.renew_message_lock(&inner.receipt).await {
                Ok(locked_until) => {
                    debug!(
                        message_id = %inner.receipt.message_id(),
                        locked_until = %locked_until,
                        "Renewed message lock"
                    );
                    inner.receipt = inner.receipt.with_locked_until(locked_until);
                    None
                }
                Err(error) if error.is_lock_lost() => {
                    warn!(
                        message_id = %inner.receipt.message_id(),
                        "Message lock lost during renewal"
                    );
                    inner.state = LockState::Expired;
                    return;
                }
                Err(error) => Some(error),
            }
        };

        if let Some(error) = failure {
            warn!(error = %error, "Lock renewal failed; will retry");
            let delay = error
                .retry_after()
                .unwrap_or_else(|| Duration::seconds(DEFAULT_RENEWAL_RETRY_SECONDS))
                .to_std()
                .unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
