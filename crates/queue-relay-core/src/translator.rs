//! Inbound to outbound message translation.

use queue_runtime::{Message, ReceivedMessage};

#[cfg(test)]
#[path = "translator_tests.rs"]
mod tests;

/// Build the message to forward for a received message.
///
/// Identity, correlation, content type, subject, every application property
/// and the body are copied unchanged, so the destination sees the message it
/// originally rejected. The result owns its data and outlives the inbound
/// message's lock.
pub fn translate(inbound: &ReceivedMessage) -> Message {
    Message {
        message_id: inbound.message_id.clone(),
        correlation_id: inbound.correlation_id.clone(),
        content_type: inbound.content_type.clone(),
        subject: inbound.subject.clone(),
        application_properties: inbound.application_properties.clone(),
        body: inbound.body.clone(),
    }
}
