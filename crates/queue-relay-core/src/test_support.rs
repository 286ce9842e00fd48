//! Recording queue client shared by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use queue_runtime::{
    Message, MessageId, ProviderType, QueueClient, QueueError, QueueName, ReceiptHandle,
    ReceivedMessage, Timestamp,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A call observed by the mock client
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Send { queue: String, message: Message },
    Complete(String),
    Abandon(String),
    Renew(String),
}

/// Queue client that records every call and fails on request
pub(crate) struct MockQueueClient {
    calls: Mutex<Vec<Call>>,
    deliveries: Mutex<VecDeque<Result<ReceivedMessage, QueueError>>>,
    send_errors: Mutex<VecDeque<QueueError>>,
    complete_errors: Mutex<VecDeque<QueueError>>,
    abandon_errors: Mutex<VecDeque<QueueError>>,
    renew_errors: Mutex<VecDeque<QueueError>>,
    send_delay: Mutex<std::time::Duration>,
    lock_extension: Duration,
    active_sends: AtomicUsize,
    max_active_sends: AtomicUsize,
}

impl MockQueueClient {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            deliveries: Mutex::new(VecDeque::new()),
            send_errors: Mutex::new(VecDeque::new()),
            complete_errors: Mutex::new(VecDeque::new()),
            abandon_errors: Mutex::new(VecDeque::new()),
            renew_errors: Mutex::new(VecDeque::new()),
            send_delay: Mutex::new(std::time::Duration::ZERO),
            lock_extension: Duration::seconds(30),
            active_sends: AtomicUsize::new(0),
            max_active_sends: AtomicUsize::new(0),
        }
    }

    pub(crate) fn deliver(&self, message: ReceivedMessage) {
        self.deliveries.lock().unwrap().push_back(Ok(message));
    }

    pub(crate) fn fail_next_receive(&self, error: QueueError) {
        self.deliveries.lock().unwrap().push_back(Err(error));
    }

    pub(crate) fn fail_next_send(&self, error: QueueError) {
        self.send_errors.lock().unwrap().push_back(error);
    }

    pub(crate) fn fail_next_complete(&self, error: QueueError) {
        self.complete_errors.lock().unwrap().push_back(error);
    }

    pub(crate) fn fail_next_abandon(&self, error: QueueError) {
        self.abandon_errors.lock().unwrap().push_back(error);
    }

    /// Lease length granted by each successful renewal
    pub(crate) fn with_lock_extension(mut self, lock_extension: Duration) -> Self {
        self.lock_extension = lock_extension;
        self
    }

    pub(crate) fn fail_next_renew(&self, error: QueueError) {
        self.renew_errors.lock().unwrap().push_back(error);
    }

    pub(crate) fn set_send_delay(&self, delay: std::time::Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn completed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Complete(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn abandoned(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Abandon(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn renewed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Renew(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn max_concurrent_sends(&self) -> usize {
        self.max_active_sends.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_deliveries(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl QueueClient for MockQueueClient {
    async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError> {
        let active = self.active_sends.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_sends.fetch_max(active, Ordering::SeqCst);

        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.active_sends.fetch_sub(1, Ordering::SeqCst);
        let message_id = message.message_id.clone();
        self.record(Call::Send {
            queue: queue.to_string(),
            message,
        });

        match self.send_errors.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(message_id),
        }
    }

    async fn receive_message(
        &self,
        _queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let next = self.deliveries.lock().unwrap().pop_front();
        match next {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(error)) => Err(error),
            None => {
                let wait = timeout
                    .to_std()
                    .unwrap_or_default()
                    .min(std::time::Duration::from_millis(5));
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.record(Call::Complete(receipt.handle().to_string()));
        match self.complete_errors.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.record(Call::Abandon(receipt.handle().to_string()));
        match self.abandon_errors.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn renew_message_lock(&self, receipt: &ReceiptHandle) -> Result<Timestamp, QueueError> {
        self.record(Call::Renew(receipt.handle().to_string()));
        match self.renew_errors.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(Timestamp::now().add(self.lock_extension)),
        }
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

pub(crate) fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

pub(crate) fn receipt(lock_token: &str, locked_for: Duration) -> ReceiptHandle {
    ReceiptHandle::new(
        queue("orders_error"),
        MessageId::new(),
        lock_token.to_string(),
        Timestamp::now().add(locked_for),
        ProviderType::InMemory,
    )
}

/// Received message whose lock token equals its id
pub(crate) fn received(id: &str, body: &str, locked_for: Duration) -> ReceivedMessage {
    let message_id: MessageId = id.parse().unwrap();
    ReceivedMessage {
        message_id: message_id.clone(),
        correlation_id: String::new(),
        content_type: String::new(),
        subject: String::new(),
        application_properties: Default::default(),
        body: Bytes::from(body.to_string()),
        receipt_handle: ReceiptHandle::new(
            queue("orders_error"),
            message_id,
            id.to_string(),
            Timestamp::now().add(locked_for),
            ProviderType::InMemory,
        ),
        delivery_count: 1,
        delivered_at: Timestamp::now(),
    }
}

pub(crate) fn connection_failed() -> QueueError {
    QueueError::ConnectionFailed {
        message: "connection reset by peer".to_string(),
    }
}

pub(crate) fn lock_lost(handle: &str) -> QueueError {
    QueueError::MessageLockLost {
        receipt: handle.to_string(),
    }
}
