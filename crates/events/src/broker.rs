//! Message broker port (publish side).
//!
//! The dispatcher treats the broker as an opaque sink: a topic, the raw payload
//! bytes and a header map. The only thing it relies on is the split between
//! [`PublishError::Permanent`] (the broker refused this message and always
//! will) and [`PublishError::Transient`] (anything that may succeed later).
//! Implementations must classify their failures precisely, because that
//! choice decides between poisoning a row and retrying it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Broker message headers.
pub type Headers = BTreeMap<String, String>;

/// Header names emitted on every published message.
pub mod headers {
    pub const TRACEPARENT: &str = "traceparent";
    pub const TRACESTATE: &str = "tracestate";
    pub const MESSAGE_ID: &str = "message-id";
    pub const EVENT_NAME: &str = "event-name";
    pub const EVENT_VERSION: &str = "event-version";
    pub const CORRELATION_ID: &str = "correlation-id";
}

/// Broker topic for an event: `"{name}.v{version}"`.
pub fn topic_for(name: &str, version: u16) -> String {
    format!("{name}.v{version}")
}

/// Publish failure, classified for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The broker rejected the message as unroutable or invalid.
    #[error("broker rejected message: {0}")]
    Permanent(String),

    /// Connectivity, availability, timeouts, cancellation.
    #[error("publish failed: {0}")]
    Transient(String),
}

impl PublishError {
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Publish side of a message broker.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Deliver one message. Implementations should return promptly once
    /// `cancel` fires (with a transient error).
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &Headers,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> BrokerPublisher for Arc<P>
where
    P: BrokerPublisher + ?Sized,
{
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &Headers,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        (**self).publish(topic, payload, headers, cancel).await
    }
}
