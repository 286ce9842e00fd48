//! Tests for in-memory queue provider.

use super::*;
use crate::provider::InMemoryConfig;

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

fn short_lock_provider(lock_millis: i64) -> InMemoryProvider {
    InMemoryProvider::new(InMemoryConfig {
        lock_duration: Duration::milliseconds(lock_millis),
        ..Default::default()
    })
}

async fn receive_now(provider: &InMemoryProvider, queue: &QueueName) -> Option<ReceivedMessage> {
    provider
        .receive_message(queue, Duration::zero())
        .await
        .unwrap()
}

// ============================================================================
// Storage Initialization Tests
// ============================================================================

mod storage_initialization {
    use super::*;

    /// Verify that InMemoryProvider can be created with default configuration.
    #[test]
    fn test_create_provider_with_default_config() {
        let provider = InMemoryProvider::default();
        assert_eq!(provider.provider_type(), ProviderType::InMemory);
    }

    /// Verify that queues are created lazily and start empty.
    #[test]
    fn test_queue_auto_creation() {
        let provider = InMemoryProvider::default();
        {
            let storage = provider.storage.read().unwrap();
            assert_eq!(storage.queues.len(), 0);
        }

        assert_eq!(provider.active_message_count(&queue("orders")), 0);
        assert_eq!(provider.storage.read().unwrap().queues.len(), 1);
    }

    /// Verify that clones share storage.
    #[tokio::test]
    async fn test_clones_share_storage() {
        let provider = InMemoryProvider::default();
        let observer = provider.clone();

        provider
            .send_message(&queue("orders"), &Message::new(Bytes::from("a")))
            .await
            .unwrap();

        assert_eq!(observer.active_message_count(&queue("orders")), 1);
    }
}

// ============================================================================
// Send and Receive Tests
// ============================================================================

mod send_receive {
    use super::*;

    /// Verify that every message attribute survives a send/receive cycle.
    #[tokio::test]
    async fn test_metadata_is_preserved() {
        let provider = InMemoryProvider::default();
        let q = queue("orders");
        let message = Message::new(Bytes::from("hello"))
            .with_message_id("m1".parse().unwrap())
            .with_correlation_id("c1")
            .with_content_type("text/plain")
            .with_subject("greeting")
            .with_property("k", "v")
            .with_property("n", 5_i64);

        let id = provider.send_message(&q, &message).await.unwrap();
        assert_eq!(id.as_str(), "m1");

        let received = receive_now(&provider, &q).await.unwrap();
        assert_eq!(received.message_id.as_str(), "m1");
        assert_eq!(received.correlation_id, "c1");
        assert_eq!(received.content_type, "text/plain");
        assert_eq!(received.subject, "greeting");
        assert_eq!(received.application_properties, message.application_properties);
        assert_eq!(received.body, Bytes::from("hello"));
        assert_eq!(received.delivery_count, 1);
        assert_eq!(received.receipt_handle.queue(), &q);
        assert!(!received.receipt_handle.is_expired());
    }

    /// Verify FIFO ordering.
    #[tokio::test]
    async fn test_messages_received_in_send_order() {
        let provider = InMemoryProvider::default();
        let q = queue("orders");

        for body in ["1", "2", "3"] {
            provider
                .send_message(&q, &Message::new(Bytes::from(body)))
                .await
                .unwrap();
        }

        for expected in ["1", "2", "3"] {
            let received = receive_now(&provider, &q).await.unwrap();
            assert_eq!(received.body, Bytes::from(expected));
        }
    }

    /// Verify that a receive on an empty queue returns None after the timeout.
    #[tokio::test]
    async fn test_receive_times_out_on_empty_queue() {
        let provider = InMemoryProvider::default();

        let result = provider
            .receive_message(&queue("empty"), Duration::milliseconds(30))
            .await
            .unwrap();

        assert!(result.is_none());
    }

    /// Verify that a waiting receive picks up a message sent while it waits.
    #[tokio::test]
    async fn test_receive_waits_for_message() {
        let provider = InMemoryProvider::default();
        let sender = provider.clone();
        let q = queue("orders");
        let q_send = q.clone();

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            sender
                .send_message(&q_send, &Message::new(Bytes::from("late")))
                .await
                .unwrap();
        });

        let received = provider
            .receive_message(&q, Duration::seconds(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.body, Bytes::from("late"));
    }

    /// Verify that a locked message is invisible to other receivers.
    #[tokio::test]
    async fn test_locked_message_is_invisible() {
        let provider = InMemoryProvider::default();
        let q = queue("orders");
        provider
            .send_message(&q, &Message::new(Bytes::from("a")))
            .await
            .unwrap();

        let _first = receive_now(&provider, &q).await.unwrap();

        assert!(receive_now(&provider, &q).await.is_none());
        assert_eq!(provider.in_flight_count(&q), 1);
    }

    /// Verify that sends beyond the queue capacity are rejected.
    #[tokio::test]
    async fn test_queue_capacity_enforced() {
        let provider = InMemoryProvider::new(InMemoryConfig {
            max_queue_size: 1,
            ..Default::default()
        });
        let q = queue("orders");

        provider
            .send_message(&q, &Message::new(Bytes::from("a")))
            .await
            .unwrap();
        let result = provider
            .send_message(&q, &Message::new(Bytes::from("b")))
            .await;

        assert!(matches!(result, Err(QueueError::ProviderError { .. })));
    }
}

// ============================================================================
// Acknowledgment Tests
// ============================================================================

mod acknowledgment {
    use super::*;

    /// Verify that complete removes the message permanently.
    #[tokio::test]
    async fn test_complete_removes_message() {
        let provider = InMemoryProvider::default();
        let q = queue("orders");
        provider
            .send_message(&q, &Message::new(Bytes::from("a")))
            .await
            .unwrap();

        let received = receive_now(&provider, &q).await.unwrap();
        provider
            .complete_message(&received.receipt_handle)
            .await
            .unwrap();

        assert_eq!(provider.active_message_count(&q), 0);
        assert_eq!(provider.in_flight_count(&q), 0);
    }

    /// Verify that a second complete on the same token fails without effect.
    #[tokio::test]
    async fn test_second_complete_fails() {
        let provider = InMemoryProvider::default();
        let q = queue("orders");
        provider
            .send_message(&q, &Message::new(Bytes::from("a")))
            .await
            .unwrap();
        let received = receive_now(&provider, &q).await.unwrap();

        provider
            .complete_message(&received.receipt_handle)
            .await
            .unwrap();
        let second = provider.complete_message(&received.receipt_handle).await;

        assert!(matches!(second, Err(QueueError::MessageLockLost { .. })));
        let abandon = provider.abandon_message(&received.receipt_handle).await;
        assert!(matches!(abandon, Err(QueueError::MessageLockLost { .. })));
    }

    /// Verify that abandon makes the message available again with its count.
    #[tokio::test]
    async fn test_abandon_redelivers_message() {
        let provider = InMemoryProvider::default();
        let q = queue("orders");
        provider
            .send_message(&q, &Message::new(Bytes::from("a")))
            .await
            .unwrap();

        let first = receive_now(&provider, &q).await.unwrap();
        provider
            .abandon_message(&first.receipt_handle)
            .await
            .unwrap();

        let second = receive_now(&provider, &q).await.unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.delivery_count, 2);
        assert_ne!(second.receipt_handle.handle(), first.receipt_handle.handle());
    }

    /// Verify that the message is dead-lettered once the delivery count is exhausted.
    #[tokio::test]
    async fn test_abandon_past_max_delivery_count_dead_letters() {
        let provider = InMemoryProvider::new(InMemoryConfig {
            max_delivery_count: 2,
            ..Default::default()
        });
        let q = queue("orders");
        provider
            .send_message(&q, &Message::new(Bytes::from("a")))
            .await
            .unwrap();

        for _ in 0..2 {
            let received = receive_now(&provider, &q).await.unwrap();
            provider
                .abandon_message(&received.receipt_handle)
                .await
                .unwrap();
        }

        assert!(receive_now(&provider, &q).await.is_none());
        assert_eq!(provider.dead_letter_count(&q), 1);
    }

    /// Verify that operations on an unknown queue report a lost lock.
    #[tokio::test]
    async fn test_unknown_queue_reports_lock_lost() {
        let provider = InMemoryProvider::default();
        let receipt = ReceiptHandle::new(
            queue("never-used"),
            MessageId::new(),
            "lock".to_string(),
            Timestamp::now(),
            ProviderType::InMemory,
        );

        let result = provider.complete_message(&receipt).await;
        assert!(matches!(result, Err(QueueError::MessageLockLost { .. })));
    }
}

// ============================================================================
// Lock Lease Tests
// ============================================================================

mod lock_lease {
    use super::*;

    /// Verify that an expired lock returns the message to the queue.
    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let provider = short_lock_provider(20);
        let q = queue("orders");
        provider
            .send_message(&q, &Message::new(Bytes::from("a")))
            .await
            .unwrap();

        let first = receive_now(&provider, &q).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        let result = provider.complete_message(&first.receipt_handle).await;
        assert!(matches!(result, Err(QueueError::MessageLockLost { .. })));

        let second = receive_now(&provider, &q).await.unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.delivery_count, 2);
    }

    /// Verify that renewing extends the lease past the original deadline.
    #[tokio::test]
    async fn test_renew_extends_lock() {
        let provider = short_lock_provider(200);
        let q = queue("orders");
        provider
            .send_message(&q, &Message::new(Bytes::from("a")))
            .await
            .unwrap();
        let received = receive_now(&provider, &q).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        let renewed_until = provider
            .renew_message_lock(&received.receipt_handle)
            .await
            .unwrap();
        assert!(&renewed_until > received.receipt_handle.locked_until());

        // Past the original deadline, inside the renewed one
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        provider
            .complete_message(&received.receipt_handle)
            .await
            .unwrap();
    }

    /// Verify that an expired lock cannot be renewed.
    #[tokio::test]
    async fn test_renew_expired_lock_fails() {
        let provider = short_lock_provider(10);
        let q = queue("orders");
        provider
            .send_message(&q, &Message::new(Bytes::from("a")))
            .await
            .unwrap();
        let received = receive_now(&provider, &q).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let result = provider.renew_message_lock(&received.receipt_handle).await;

        assert!(matches!(result, Err(QueueError::MessageLockLost { .. })));
    }

    /// Verify that reclaimed messages keep their original order.
    #[tokio::test]
    async fn test_reclaimed_messages_keep_order() {
        let provider = short_lock_provider(20);
        let q = queue("orders");
        for body in ["1", "2"] {
            provider
                .send_message(&q, &Message::new(Bytes::from(body)))
                .await
                .unwrap();
        }
        let _a = receive_now(&provider, &q).await.unwrap();
        let _b = receive_now(&provider, &q).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        let bodies: Vec<Bytes> = provider.peek_messages(&q).into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![Bytes::from("1"), Bytes::from("2")]);
    }
}
