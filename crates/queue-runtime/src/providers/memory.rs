//! In-memory queue provider implementation for testing and development.
//!
//! This module provides a fully functional in-memory queue implementation that:
//! - Implements peek-lock receive with per-message lock leases
//! - Reclaims messages whose lock lease ran out
//! - Moves messages past their maximum delivery count to a dead-letter store
//! - Provides thread-safe concurrent access
//!
//! This provider is intended for:
//! - Unit and integration testing of queue-runtime consumers
//! - Development and prototyping
//! - Reference implementation for cloud providers

use crate::client::QueueProvider;
use crate::error::QueueError;
use crate::message::{
    ApplicationProperties, Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage,
    Timestamp,
};
use crate::provider::{InMemoryConfig, ProviderType};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage for all queues
struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
    config: InMemoryConfig,
}

impl QueueStorage {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            queues: HashMap::new(),
            config,
        }
    }

    /// Get or create a queue
    fn get_or_create_queue(&mut self, queue_name: &QueueName) -> &mut InMemoryQueue {
        self.queues
            .entry(queue_name.clone())
            .or_insert_with(|| InMemoryQueue::new(self.config.clone()))
    }
}

/// Internal queue state for a single queue
struct InMemoryQueue {
    /// Main message queue (FIFO order)
    messages: VecDeque<StoredMessage>,
    /// Messages that exceeded the maximum delivery count
    dead_letter: Vec<StoredMessage>,
    /// In-flight messages keyed by lock token
    in_flight: HashMap<String, InFlightMessage>,
    config: InMemoryConfig,
}

impl InMemoryQueue {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            messages: VecDeque::new(),
            dead_letter: Vec::new(),
            in_flight: HashMap::new(),
            config,
        }
    }

    fn enqueue(&mut self, queue_name: &QueueName, message: StoredMessage) -> Result<(), QueueError> {
        if self.messages.len() + self.in_flight.len() >= self.config.max_queue_size {
            return Err(QueueError::ProviderError {
                provider: ProviderType::InMemory.to_string(),
                code: "QueueFull".to_string(),
                message: format!(
                    "queue '{}' holds the maximum of {} messages",
                    queue_name, self.config.max_queue_size
                ),
            });
        }

        self.messages.push_back(message);
        Ok(())
    }

    /// Return messages with lapsed locks to the head of the queue
    fn reclaim_expired_locks(&mut self) {
        let mut expired: Vec<InFlightMessage> = Vec::new();
        self.in_flight.retain(|_, in_flight| {
            if in_flight.is_expired() {
                expired.push(in_flight.clone());
                false
            } else {
                true
            }
        });

        // Oldest first so that push_front in reverse keeps arrival order
        expired.sort_by(|a, b| a.message.sequence_number.cmp(&b.message.sequence_number));
        for in_flight in expired.into_iter().rev() {
            debug!(
                message_id = %in_flight.message.message_id,
                "Message lock expired; returning message to queue"
            );
            self.release(in_flight.message);
        }
    }

    /// Make a previously locked message available again or dead-letter it
    fn release(&mut self, message: StoredMessage) {
        if message.delivery_count >= self.config.max_delivery_count {
            debug!(
                message_id = %message.message_id,
                delivery_count = message.delivery_count,
                "Maximum delivery count reached; moving message to dead-letter store"
            );
            self.dead_letter.push(message);
        } else {
            self.messages.push_front(message);
        }
    }

    fn try_receive(&mut self, queue_name: &QueueName) -> Option<ReceivedMessage> {
        self.reclaim_expired_locks();

        let mut message = self.messages.pop_front()?;
        message.delivery_count += 1;

        let lock_token = uuid::Uuid::new_v4().to_string();
        let now = Timestamp::now();
        let lock_expires_at = now.add(self.config.lock_duration);

        let received = ReceivedMessage {
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id.clone(),
            content_type: message.content_type.clone(),
            subject: message.subject.clone(),
            application_properties: message.application_properties.clone(),
            body: message.body.clone(),
            receipt_handle: ReceiptHandle::new(
                queue_name.clone(),
                message.message_id.clone(),
                lock_token.clone(),
                lock_expires_at.clone(),
                ProviderType::InMemory,
            ),
            delivery_count: message.delivery_count,
            delivered_at: now,
        };

        self.in_flight.insert(
            lock_token,
            InFlightMessage {
                message,
                lock_expires_at,
            },
        );

        Some(received)
    }

    /// Remove the in-flight entry for a still-valid lock
    fn take_locked(&mut self, receipt: &ReceiptHandle) -> Result<InFlightMessage, QueueError> {
        self.reclaim_expired_locks();
        self.in_flight
            .remove(receipt.handle())
            .ok_or_else(|| lock_lost(receipt))
    }
}

/// A message stored in the queue with metadata
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    correlation_id: String,
    content_type: String,
    subject: String,
    application_properties: ApplicationProperties,
    body: Bytes,
    sequence_number: u64,
    delivery_count: u32,
}

impl StoredMessage {
    fn from_message(message: &Message, sequence_number: u64) -> Self {
        Self {
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id.clone(),
            content_type: message.content_type.clone(),
            subject: message.subject.clone(),
            application_properties: message.application_properties.clone(),
            body: message.body.clone(),
            sequence_number,
            delivery_count: 0,
        }
    }

    fn to_message(&self) -> Message {
        Message {
            message_id: self.message_id.clone(),
            correlation_id: self.correlation_id.clone(),
            content_type: self.content_type.clone(),
            subject: self.subject.clone(),
            application_properties: self.application_properties.clone(),
            body: self.body.clone(),
        }
    }
}

/// A message currently being processed
#[derive(Clone)]
struct InFlightMessage {
    message: StoredMessage,
    lock_expires_at: Timestamp,
}

impl InFlightMessage {
    fn is_expired(&self) -> bool {
        Timestamp::now() >= self.lock_expires_at
    }
}

fn lock_lost(receipt: &ReceiptHandle) -> QueueError {
    QueueError::MessageLockLost {
        receipt: receipt.handle().to_string(),
    }
}

fn storage_poisoned() -> QueueError {
    QueueError::ProviderError {
        provider: ProviderType::InMemory.to_string(),
        code: "StoragePoisoned".to_string(),
        message: "in-memory queue storage lock was poisoned".to_string(),
    }
}

// ============================================================================
// InMemoryProvider
// ============================================================================

/// In-memory queue provider implementation
///
/// Cloning shares the underlying storage, so a test can keep a handle for
/// inspection while a client owns another.
#[derive(Clone)]
pub struct InMemoryProvider {
    storage: Arc<RwLock<QueueStorage>>,
    next_sequence: Arc<std::sync::atomic::AtomicU64>,
}

impl InMemoryProvider {
    /// Create new in-memory provider with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::new(config))),
            next_sequence: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    fn with_queue<R>(
        &self,
        queue: &QueueName,
        f: impl FnOnce(&mut InMemoryQueue) -> R,
    ) -> Result<R, QueueError> {
        let mut storage = self.storage.write().map_err(|_| storage_poisoned())?;
        Ok(f(storage.get_or_create_queue(queue)))
    }

    fn with_existing_queue<R>(
        &self,
        receipt: &ReceiptHandle,
        f: impl FnOnce(&mut InMemoryQueue) -> Result<R, QueueError>,
    ) -> Result<R, QueueError> {
        let mut storage = self.storage.write().map_err(|_| storage_poisoned())?;
        match storage.queues.get_mut(receipt.queue()) {
            Some(queue) => f(queue),
            None => Err(lock_lost(receipt)),
        }
    }

    /// Number of messages available for receiving
    pub fn active_message_count(&self, queue: &QueueName) -> usize {
        self.with_queue(queue, |q| {
            q.reclaim_expired_locks();
            q.messages.len()
        })
        .unwrap_or_default()
    }

    /// Number of messages currently locked by a receiver
    pub fn in_flight_count(&self, queue: &QueueName) -> usize {
        self.with_queue(queue, |q| {
            q.reclaim_expired_locks();
            q.in_flight.len()
        })
        .unwrap_or_default()
    }

    /// Number of messages moved to the dead-letter store
    pub fn dead_letter_count(&self, queue: &QueueName) -> usize {
        self.with_queue(queue, |q| {
            q.reclaim_expired_locks();
            q.dead_letter.len()
        })
        .unwrap_or_default()
    }

    /// Copies of the messages available for receiving, in queue order
    pub fn peek_messages(&self, queue: &QueueName) -> Vec<Message> {
        self.with_queue(queue, |q| {
            q.reclaim_expired_locks();
            q.messages.iter().map(StoredMessage::to_message).collect()
        })
        .unwrap_or_default()
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl QueueProvider for InMemoryProvider {
    async fn send_message(
        &self,
        queue: &QueueName,
        message: &Message,
    ) -> Result<MessageId, QueueError> {
        let sequence_number = self
            .next_sequence
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let stored = StoredMessage::from_message(message, sequence_number);

        self.with_queue(queue, |q| q.enqueue(queue, stored))??;

        Ok(message.message_id.clone())
    }

    async fn receive_message(
        &self,
        queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let poll_interval = {
            let storage = self.storage.read().map_err(|_| storage_poisoned())?;
            storage.config.poll_interval.to_std().unwrap_or_default()
        };
        let deadline = tokio::time::Instant::now() + timeout.to_std().unwrap_or_default();

        loop {
            if let Some(received) = self.with_queue(queue, |q| q.try_receive(queue))? {
                return Ok(Some(received));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.with_existing_queue(receipt, |q| q.take_locked(receipt).map(|_| ()))
    }

    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.with_existing_queue(receipt, |q| {
            let in_flight = q.take_locked(receipt)?;
            q.release(in_flight.message);
            Ok(())
        })
    }

    async fn renew_message_lock(&self, receipt: &ReceiptHandle) -> Result<Timestamp, QueueError> {
        self.with_existing_queue(receipt, |q| {
            q.reclaim_expired_locks();
            let lock_duration = q.config.lock_duration;
            let in_flight = q
                .in_flight
                .get_mut(receipt.handle())
                .ok_or_else(|| lock_lost(receipt))?;

            in_flight.lock_expires_at = Timestamp::now().add(lock_duration);
            Ok(in_flight.lock_expires_at.clone())
        })
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}
