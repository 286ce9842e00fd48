//! # Queue Runtime
//!
//! Peek-lock queue runtime used by Queue-Relay, with Azure Service Bus and
//! in-memory implementations.
//!
//! This library provides:
//! - Provider-agnostic queue operations
//! - Peek-lock receive with complete, abandon and lock renewal
//! - Typed message metadata including scalar application properties
//! - Error classification for transient failures and lost locks
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Message structures and receipt handles
//! - [`provider`] - Provider types and configuration
//! - [`client`] - Client traits and implementations
//! - [`providers`] - Azure Service Bus and in-memory backends

// Module declarations
pub mod client;
pub mod error;
pub mod message;
pub mod provider;
pub mod providers;

// Re-export commonly used types at crate root for convenience
pub use client::{QueueClient, QueueClientFactory, QueueProvider, StandardQueueClient};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use message::{
    ApplicationProperties, Message, MessageId, PropertyValue, QueueName, ReceiptHandle,
    ReceivedMessage, Timestamp,
};
pub use provider::{
    AzureServiceBusConfig, InMemoryConfig, ProviderConfig, ProviderType, QueueConfig,
};
pub use providers::{AzureServiceBusProvider, InMemoryProvider};
