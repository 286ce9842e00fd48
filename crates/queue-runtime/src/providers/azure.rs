//! Azure Service Bus provider implementation.
//!
//! This module talks to Service Bus through its HTTP API:
//! - Shared Access Signature authentication derived from a connection string
//! - Peek-lock receive with explicit complete, abandon (unlock) and lock renewal
//! - Broker properties (`MessageId`, `CorrelationId`, `Label`, `LockToken`,
//!   `LockedUntilUtc`, `DeliveryCount`) carried in the `BrokerProperties` header
//! - Application properties carried as custom headers with JSON scalar values
//! - Error classification for retry logic
//!
//! HTTP header names are case-insensitive, so application property names come
//! back lowercased on receive: a message sent with `OrderId` is received with
//! `orderid`. Property names that collide with transport headers such as
//! `Content-Type` are rejected on send.
//!
//! ## Example
//!
//! ```no_run
//! use queue_runtime::{AzureServiceBusConfig, ProviderConfig, QueueClientFactory, QueueConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = QueueConfig {
//!     provider: ProviderConfig::AzureServiceBus(AzureServiceBusConfig::from_connection_string(
//!         "Endpoint=sb://example.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=...",
//!     )),
//! };
//!
//! let client = QueueClientFactory::create_client(config).await?;
//! # Ok(())
//! # }
//! ```

use crate::client::QueueProvider;
use crate::error::{ConfigurationError, QueueError, SerializationError};
use crate::message::{
    ApplicationProperties, Message, MessageId, PropertyValue, QueueName, ReceiptHandle,
    ReceivedMessage, Timestamp,
};
use crate::provider::{AzureServiceBusConfig, ProviderType};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, warn};
use url::Url;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "azure_tests.rs"]
mod tests;

const BROKER_PROPERTIES_HEADER: &str = "BrokerProperties";

/// Response headers that are transport metadata rather than application properties
const STANDARD_HEADERS: &[&str] = &[
    "brokerproperties",
    "content-type",
    "content-length",
    "content-encoding",
    "connection",
    "date",
    "location",
    "server",
    "strict-transport-security",
    "transfer-encoding",
];

/// Refresh tokens this long before they expire
const TOKEN_REFRESH_MARGIN_SECONDS: i64 = 300;

/// Backoff for throttled requests that carry no usable `Retry-After`
const DEFAULT_THROTTLE_SECONDS: i64 = 10;

// ============================================================================
// Connection String
// ============================================================================

/// Parsed Service Bus connection string
#[derive(Clone)]
pub struct ServiceBusConnection {
    endpoint: Url,
    key_name: String,
    key: Zeroizing<String>,
}

impl ServiceBusConnection {
    /// Parse `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...`
    ///
    /// `sb://` endpoints are addressed over HTTPS; `http://` and `https://`
    /// endpoints are used as given.
    pub fn parse(connection_string: &str) -> Result<Self, ConfigurationError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;

        for part in connection_string.split(';').filter(|p| !p.trim().is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| ConfigurationError::Parsing {
                message: "connection string segments must be 'Name=Value'".to_string(),
            })?;

            match name.trim() {
                "Endpoint" => endpoint = Some(value.trim().to_string()),
                "SharedAccessKeyName" => key_name = Some(value.trim().to_string()),
                "SharedAccessKey" => key = Some(Zeroizing::new(value.trim().to_string())),
                _ => {}
            }
        }

        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ConfigurationError::Missing {
                key: "Endpoint".to_string(),
            })?;
        let key_name = key_name
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigurationError::Missing {
                key: "SharedAccessKeyName".to_string(),
            })?;
        let key = key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigurationError::Missing {
                key: "SharedAccessKey".to_string(),
            })?;

        let endpoint = Self::normalize_endpoint(&endpoint)?;

        Ok(Self {
            endpoint,
            key_name,
            key,
        })
    }

    fn normalize_endpoint(raw: &str) -> Result<Url, ConfigurationError> {
        let with_scheme = match raw.strip_prefix("sb://") {
            Some(rest) => format!("https://{}", rest),
            None => raw.to_string(),
        };
        let with_slash = if with_scheme.ends_with('/') {
            with_scheme
        } else {
            format!("{}/", with_scheme)
        };

        let url = Url::parse(&with_slash).map_err(|e| ConfigurationError::Parsing {
            message: format!("invalid endpoint '{}': {}", raw, e),
        })?;

        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(ConfigurationError::Invalid {
                message: format!("unsupported endpoint scheme '{}'", url.scheme()),
            });
        }

        Ok(url)
    }

    /// Namespace endpoint used as the base for entity URLs
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Name of the shared access policy
    pub fn key_name(&self) -> &str {
        &self.key_name
    }
}

impl fmt::Debug for ServiceBusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBusConnection")
            .field("endpoint", &self.endpoint.as_str())
            .field("key_name", &self.key_name)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// Shared Access Signature
// ============================================================================

/// Build a Shared Access Signature token for a resource URI
///
/// The signature is HMAC-SHA256 over `url_encode(resource) + "\n" + expiry`
/// keyed with the shared access key.
pub fn generate_sas_token(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    expires_at_unix: i64,
) -> Result<String, QueueError> {
    let encoded_resource = urlencoding::encode(resource_uri);
    let string_to_sign = format!("{}\n{}", encoded_resource, expires_at_unix);

    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).map_err(|e| {
        QueueError::AuthenticationFailed {
            message: format!("invalid shared access key: {}", e),
        }
    })?;
    mac.update(string_to_sign.as_bytes());
    let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
        encoded_resource,
        urlencoding::encode(&signature),
        expires_at_unix,
        key_name
    ))
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

// ============================================================================
// Broker Properties
// ============================================================================

/// Subset of broker properties exchanged through the `BrokerProperties` header
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(skip_serializing)]
    lock_token: Option<String>,
    #[serde(skip_serializing)]
    locked_until_utc: Option<String>,
    #[serde(skip_serializing)]
    delivery_count: Option<u32>,
}

impl BrokerProperties {
    fn for_message(message: &Message) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            message_id: Some(message.message_id.to_string()),
            correlation_id: non_empty(&message.correlation_id),
            label: non_empty(&message.subject),
            ..Default::default()
        }
    }

    fn from_headers(headers: &HeaderMap) -> Result<Self, QueueError> {
        let raw = headers
            .get("brokerproperties")
            .ok_or_else(|| SerializationError::InvalidBrokerProperty {
                name: BROKER_PROPERTIES_HEADER.to_string(),
                message: "header missing from response".to_string(),
            })?
            .to_str()
            .map_err(|e| SerializationError::InvalidBrokerProperty {
                name: BROKER_PROPERTIES_HEADER.to_string(),
                message: e.to_string(),
            })?;

        Ok(serde_json::from_str(raw).map_err(SerializationError::from)?)
    }

    fn locked_until(&self) -> Result<Option<Timestamp>, QueueError> {
        match &self.locked_until_utc {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc2822(raw)
                .map(|dt| Some(Timestamp::from_datetime(dt.with_timezone(&Utc))))
                .map_err(|e| {
                    SerializationError::InvalidBrokerProperty {
                        name: "LockedUntilUtc".to_string(),
                        message: e.to_string(),
                    }
                    .into()
                }),
        }
    }
}

// ============================================================================
// Azure Service Bus Provider
// ============================================================================

/// Azure Service Bus queue provider using the Service Bus HTTP API
pub struct AzureServiceBusProvider {
    config: AzureServiceBusConfig,
    connection: ServiceBusConnection,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl AzureServiceBusProvider {
    /// Create new Azure Service Bus provider
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the connection string is malformed
    /// or the HTTP client cannot be built.
    pub fn new(config: AzureServiceBusConfig) -> Result<Self, QueueError> {
        let connection = ServiceBusConnection::parse(&config.connection_string)?;
        let request_timeout = config.request_timeout.to_std().map_err(|_| {
            ConfigurationError::Invalid {
                message: "request_timeout must not be negative".to_string(),
            }
        })?;

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        debug!(
            endpoint = %connection.endpoint(),
            key_name = %connection.key_name(),
            "Created Azure Service Bus provider"
        );

        Ok(Self {
            config,
            connection,
            http,
            token: Mutex::new(None),
        })
    }

    /// Current SAS token, regenerated shortly before it expires
    fn authorization(&self) -> Result<String, QueueError> {
        let mut cached = self.token.lock().map_err(|_| QueueError::ProviderError {
            provider: ProviderType::AzureServiceBus.to_string(),
            code: "TokenCachePoisoned".to_string(),
            message: "token cache lock was poisoned".to_string(),
        })?;

        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - now > Duration::seconds(TOKEN_REFRESH_MARGIN_SECONDS) {
                return Ok(token.token.clone());
            }
        }

        let expires_at = now + self.config.token_lifetime;
        let token = generate_sas_token(
            self.connection.endpoint().as_str(),
            self.connection.key_name(),
            &self.connection.key,
            expires_at.timestamp(),
        )?;

        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    fn entity_url(&self, path: &str) -> Result<Url, QueueError> {
        self.connection
            .endpoint()
            .join(path)
            .map_err(|e| {
                ConfigurationError::Invalid {
                    message: format!("invalid entity path '{}': {}", path, e),
                }
                .into()
            })
    }

    fn lock_url(&self, receipt: &ReceiptHandle) -> Result<Url, QueueError> {
        self.entity_url(&format!(
            "{}/messages/{}/{}",
            receipt.queue(),
            urlencoding::encode(receipt.message_id().as_str()),
            urlencoding::encode(receipt.handle())
        ))
    }

    async fn lock_operation(
        &self,
        method: Method,
        receipt: &ReceiptHandle,
        operation: &str,
    ) -> Result<reqwest::Response, QueueError> {
        let url = self.lock_url(receipt)?;
        let response = self
            .http
            .request(method, url)
            .header(AUTHORIZATION, self.authorization()?)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(map_transport_error)?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(response),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(QueueError::MessageLockLost {
                receipt: receipt.handle().to_string(),
            }),
            status => Err(map_status(status, operation, receipt.queue(), response).await),
        }
    }
}

impl fmt::Debug for AzureServiceBusProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureServiceBusProvider")
            .field("connection", &self.connection)
            .finish()
    }
}

#[async_trait]
impl QueueProvider for AzureServiceBusProvider {
    async fn send_message(
        &self,
        queue: &QueueName,
        message: &Message,
    ) -> Result<MessageId, QueueError> {
        let url = self.entity_url(&format!("{}/messages", queue))?;
        let broker_properties = serde_json::to_string(&BrokerProperties::for_message(message))
            .map_err(SerializationError::from)?;

        let mut headers = encode_application_properties(&message.application_properties)?;
        headers.insert(
            HeaderName::from_static("brokerproperties"),
            header_value(BROKER_PROPERTIES_HEADER, &broker_properties)?,
        );
        if !message.content_type.is_empty() {
            headers.insert(CONTENT_TYPE, header_value("Content-Type", &message.content_type)?);
        }

        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, self.authorization()?)
            .headers(headers)
            .body(message.body.clone())
            .send()
            .await
            .map_err(map_transport_error)?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                debug!(queue = %queue, message_id = %message.message_id, "Message sent");
                Ok(message.message_id.clone())
            }
            status => Err(map_status(status, "send", queue, response).await),
        }
    }

    async fn receive_message(
        &self,
        queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let wait_seconds = timeout.num_seconds().max(0);
        let mut url = self.entity_url(&format!("{}/messages/head", queue))?;
        url.query_pairs_mut()
            .append_pair("timeout", &wait_seconds.to_string());

        // The long poll may legitimately take the whole wait
        let request_timeout = (timeout + self.config.request_timeout)
            .to_std()
            .unwrap_or_default();

        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, self.authorization()?)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .timeout(request_timeout)
            .send()
            .await
            .map_err(map_transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::CREATED | StatusCode::OK => {
                let received = decode_received_message(queue, response, &self.config).await?;
                Ok(Some(received))
            }
            status => Err(map_status(status, "receive", queue, response).await),
        }
    }

    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.lock_operation(Method::DELETE, receipt, "complete")
            .await
            .map(|_| ())
    }

    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.lock_operation(Method::PUT, receipt, "abandon")
            .await
            .map(|_| ())
    }

    async fn renew_message_lock(&self, receipt: &ReceiptHandle) -> Result<Timestamp, QueueError> {
        let response = self
            .lock_operation(Method::POST, receipt, "renew lock")
            .await?;

        let reported = match BrokerProperties::from_headers(response.headers()) {
            Ok(props) => props.locked_until()?,
            Err(_) => None,
        };

        Ok(reported.unwrap_or_else(|| Timestamp::now().add(self.config.lock_duration)))
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AzureServiceBus
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

fn header_value(name: &str, value: &str) -> Result<HeaderValue, QueueError> {
    HeaderValue::from_str(value).map_err(|_| {
        SerializationError::InvalidBrokerProperty {
            name: name.to_string(),
            message: "value is not a valid HTTP header".to_string(),
        }
        .into()
    })
}

fn encode_application_properties(
    properties: &ApplicationProperties,
) -> Result<HeaderMap, QueueError> {
    let mut headers = HeaderMap::new();
    for (key, value) in properties {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| SerializationError::InvalidProperty { key: key.clone() })?;
        if STANDARD_HEADERS.contains(&name.as_str()) {
            return Err(SerializationError::InvalidProperty { key: key.clone() }.into());
        }
        let value = HeaderValue::from_str(&value.to_json_scalar())
            .map_err(|_| SerializationError::InvalidProperty { key: key.clone() })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Application properties from custom headers, keyed by lowercase name
fn decode_application_properties(headers: &HeaderMap) -> ApplicationProperties {
    let mut properties = ApplicationProperties::new();
    for (name, value) in headers {
        let name = name.as_str();
        if STANDARD_HEADERS.contains(&name) || name.starts_with("x-ms-") {
            continue;
        }
        match value.to_str() {
            Ok(raw) => {
                properties.insert(name.to_string(), PropertyValue::from_json_scalar(raw));
            }
            Err(_) => warn!(property = %name, "Skipping application property with non-text value"),
        }
    }
    properties
}

async fn decode_received_message(
    queue: &QueueName,
    response: reqwest::Response,
    config: &AzureServiceBusConfig,
) -> Result<ReceivedMessage, QueueError> {
    let headers = response.headers().clone();
    let broker = BrokerProperties::from_headers(&headers)?;

    let message_id: MessageId = broker
        .message_id
        .as_deref()
        .unwrap_or_default()
        .parse()?;
    let lock_token = broker
        .lock_token
        .clone()
        .ok_or_else(|| SerializationError::InvalidBrokerProperty {
            name: "LockToken".to_string(),
            message: "missing from peek-lock response".to_string(),
        })?;
    let now = Timestamp::now();
    let locked_until = broker
        .locked_until()?
        .unwrap_or_else(|| now.add(config.lock_duration));

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let body = response.bytes().await.map_err(map_transport_error)?;

    Ok(ReceivedMessage {
        receipt_handle: ReceiptHandle::new(
            queue.clone(),
            message_id.clone(),
            lock_token,
            locked_until,
            ProviderType::AzureServiceBus,
        ),
        message_id,
        correlation_id: broker.correlation_id.unwrap_or_default(),
        content_type,
        subject: broker.label.unwrap_or_default(),
        application_properties: decode_application_properties(&headers),
        body,
        delivery_count: broker.delivery_count.unwrap_or(1),
        delivered_at: now,
    })
}

// ============================================================================
// Error mapping
// ============================================================================

fn map_transport_error(error: reqwest::Error) -> QueueError {
    if error.is_timeout() {
        QueueError::Timeout {
            duration: Duration::zero(),
        }
    } else {
        QueueError::ConnectionFailed {
            message: error.to_string(),
        }
    }
}

async fn map_status(
    status: StatusCode,
    operation: &str,
    queue: &QueueName,
    response: reqwest::Response,
) -> QueueError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return QueueError::Throttled {
            retry_after: retry_after_header(response.headers()),
        };
    }

    let detail = response.text().await.unwrap_or_default();

    match status {
        StatusCode::UNAUTHORIZED => QueueError::AuthenticationFailed {
            message: format!("{} on '{}' rejected: {}", operation, queue, detail),
        },
        StatusCode::FORBIDDEN => QueueError::PermissionDenied {
            operation: format!("{} on '{}'", operation, queue),
        },
        StatusCode::NOT_FOUND => QueueError::QueueNotFound {
            queue_name: queue.to_string(),
        },
        StatusCode::PAYLOAD_TOO_LARGE => QueueError::MessageTooLarge {
            size: 0,
            max_size: ProviderType::AzureServiceBus.max_message_size(),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => QueueError::Timeout {
            duration: Duration::zero(),
        },
        status => QueueError::ProviderError {
            provider: ProviderType::AzureServiceBus.to_string(),
            code: status.as_u16().to_string(),
            message: format!("{} on '{}' failed: {}", operation, queue, detail),
        },
    }
}

/// Delay requested by a throttled response, in whole seconds
fn retry_after_header(headers: &HeaderMap) -> Duration {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|seconds| *seconds > 0)
        .map(Duration::seconds)
        .unwrap_or_else(|| Duration::seconds(DEFAULT_THROTTLE_SECONDS))
}
