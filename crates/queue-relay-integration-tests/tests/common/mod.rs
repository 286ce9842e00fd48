//! Shared fixtures for relay integration tests
//!
//! Source and destination are separate in-memory namespaces. The fixture
//! keeps a provider handle for each so tests can inspect queue contents while
//! the relay owns the clients.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use queue_relay_core::{LockRenewalPolicy, Relay, RelayOptions};
use queue_runtime::{
    InMemoryConfig, InMemoryProvider, Message, MessageId, ProviderType, QueueClient,
    QueueError, QueueName, ReceiptHandle, ReceivedMessage, StandardQueueClient, Timestamp,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const DESTINATION: &str = "orders";
pub const SOURCE: &str = "orders_error";

/// Two in-memory namespaces joined by a relay
pub struct Fixture {
    pub source: InMemoryProvider,
    pub destination: InMemoryProvider,
    pub source_queue: QueueName,
    pub destination_queue: QueueName,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_configs(InMemoryConfig::default(), InMemoryConfig::default())
    }

    pub fn with_configs(source: InMemoryConfig, destination: InMemoryConfig) -> Self {
        Self {
            source: InMemoryProvider::new(source),
            destination: InMemoryProvider::new(destination),
            source_queue: queue(SOURCE),
            destination_queue: queue(DESTINATION),
        }
    }

    pub fn source_client(&self) -> Arc<dyn QueueClient> {
        client(&self.source)
    }

    pub fn destination_client(&self) -> Arc<dyn QueueClient> {
        client(&self.destination)
    }

    /// Relay over both namespaces
    pub fn relay(&self, options: RelayOptions) -> Relay {
        self.relay_to(self.destination_client(), options)
    }

    /// Relay that delivers through `destination` instead of the fixture's client
    pub fn relay_to(&self, destination: Arc<dyn QueueClient>, options: RelayOptions) -> Relay {
        Relay::new(
            self.source_client(),
            self.source_queue.clone(),
            destination,
            self.destination_queue.clone(),
            options,
        )
    }

    /// Put a message on the source queue
    pub async fn seed(&self, message: Message) {
        self.source_client()
            .send_message(&self.source_queue, message)
            .await
            .unwrap();
    }

    /// Receive the next source message under a lock
    pub async fn receive(&self) -> ReceivedMessage {
        self.source_client()
            .receive_message(&self.source_queue, Duration::seconds(1))
            .await
            .unwrap()
            .expect("source queue is empty")
    }

    pub fn delivered(&self) -> Vec<Message> {
        self.destination.peek_messages(&self.destination_queue)
    }

    pub fn waiting_in_source(&self) -> Vec<Message> {
        self.source.peek_messages(&self.source_queue)
    }
}

pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

pub fn client(provider: &InMemoryProvider) -> Arc<dyn QueueClient> {
    Arc::new(StandardQueueClient::new(Box::new(provider.clone())))
}

pub fn message(id: &str, body: &'static str) -> Message {
    Message::new(Bytes::from_static(body.as_bytes())).with_message_id(id.parse().unwrap())
}

/// Options with short timeouts suited to tests
pub fn fast_options() -> RelayOptions {
    RelayOptions {
        max_concurrent_deliveries: 1,
        receive_timeout: Duration::milliseconds(50),
        receive_error_backoff: Duration::milliseconds(20),
        lock_renewal: LockRenewalPolicy::disabled(),
    }
}

/// Namespace whose locks lapse after `lock_duration`
pub fn short_lock_config(lock_duration: Duration) -> InMemoryConfig {
    InMemoryConfig {
        lock_duration,
        ..Default::default()
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Destination wrappers
// ============================================================================

/// Destination client that delays sends and can be told to reject them
pub struct SlowDestination {
    inner: Arc<dyn QueueClient>,
    send_delay: std::time::Duration,
    failures_left: AtomicUsize,
}

impl SlowDestination {
    pub fn new(inner: Arc<dyn QueueClient>, send_delay: std::time::Duration) -> Self {
        Self {
            inner,
            send_delay,
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Reject the next `count` sends with a transient error
    pub fn failing(inner: Arc<dyn QueueClient>, count: usize) -> Self {
        Self {
            inner,
            send_delay: std::time::Duration::ZERO,
            failures_left: AtomicUsize::new(count),
        }
    }
}

#[async_trait]
impl QueueClient for SlowDestination {
    async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError> {
        tokio::time::sleep(self.send_delay).await;

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::ConnectionFailed {
                message: "destination unreachable".to_string(),
            });
        }

        self.inner.send_message(queue, message).await
    }

    async fn receive_message(
        &self,
        queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        self.inner.receive_message(queue, timeout).await
    }

    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.inner.complete_message(receipt).await
    }

    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.inner.abandon_message(receipt).await
    }

    async fn renew_message_lock(&self, receipt: &ReceiptHandle) -> Result<Timestamp, QueueError> {
        self.inner.renew_message_lock(receipt).await
    }

    fn provider_type(&self) -> ProviderType {
        self.inner.provider_type()
    }
}
