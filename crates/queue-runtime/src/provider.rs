//! Provider types and configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    AzureServiceBus,
    InMemory,
}

impl ProviderType {
    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::AzureServiceBus => 256 * 1024, // Standard tier
            Self::InMemory => 10 * 1024 * 1024,  // 10MB
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AzureServiceBus => write!(f, "AzureServiceBus"),
            Self::InMemory => write!(f, "InMemory"),
        }
    }
}

/// Configuration for queue client initialization
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub provider: ProviderConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::InMemory(InMemoryConfig::default()),
        }
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    AzureServiceBus(AzureServiceBusConfig),
    InMemory(InMemoryConfig),
}

/// Azure Service Bus configuration
#[derive(Clone)]
pub struct AzureServiceBusConfig {
    /// `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...`
    pub connection_string: Zeroizing<String>,
    /// Per-request HTTP timeout, excluding the long-poll receive wait
    pub request_timeout: Duration,
    /// Lifetime of generated shared access signature tokens
    pub token_lifetime: Duration,
    /// Lock duration configured on the queue entity, used when a renewal
    /// response does not report the new lease deadline
    pub lock_duration: Duration,
}

impl AzureServiceBusConfig {
    /// Configuration with defaults for the given connection string
    pub fn from_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: Zeroizing::new(connection_string.into()),
            request_timeout: Duration::seconds(60),
            token_lifetime: Duration::hours(1),
            lock_duration: Duration::seconds(60),
        }
    }
}

impl fmt::Debug for AzureServiceBusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureServiceBusConfig")
            .field("connection_string", &"[REDACTED]")
            .field("request_timeout", &self.request_timeout)
            .field("token_lifetime", &self.token_lifetime)
            .field("lock_duration", &self.lock_duration)
            .finish()
    }
}

/// In-memory provider configuration
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    pub max_queue_size: usize,
    /// Deliveries allowed before a message is moved to the dead-letter store
    pub max_delivery_count: u32,
    /// Lease granted to each received message
    pub lock_duration: Duration,
    /// Interval between availability checks while a receive is waiting
    pub poll_interval: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
            max_delivery_count: 10,
            lock_duration: Duration::seconds(60),
            poll_interval: Duration::milliseconds(10),
        }
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
