//! Transport abstraction traits for Tether.
//!
//! These traits define the interface a pub/sub transport must provide,
//! allowing the bridge to stay transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tether_protocol::TopicFilter;
use thiserror::Error;
use tokio::sync::mpsc;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// A message delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

impl TransportMessage {
    /// Create a new transport message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,

    /// Topic name is not publishable.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// Topic filter is malformed.
    #[error("Invalid topic filter: {0}")]
    InvalidFilter(&'static str),

    /// Payload exceeds the transport limit.
    #[error("Payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Messages matching one topic filter.
///
/// Dropping the subscription releases it; the transport notices on its
/// next delivery attempt.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    filter: TopicFilter,
    receiver: mpsc::Receiver<TransportMessage>,
}

impl Subscription {
    /// Create a subscription from its receiving half.
    #[must_use]
    pub fn new(
        id: SubscriptionId,
        filter: TopicFilter,
        receiver: mpsc::Receiver<TransportMessage>,
    ) -> Self {
        Self {
            id,
            filter,
            receiver,
        }
    }

    /// The subscription identifier.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The filter this subscription was created with.
    #[must_use]
    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the transport has shut down.
    pub async fn recv(&mut self) -> Option<TransportMessage> {
        self.receiver.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<TransportMessage> {
        self.receiver.try_recv().ok()
    }
}

/// A topic-based publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to a topic filter (`+` matches one segment, trailing `#` the rest).
    async fn subscribe(&self, filter: &str) -> Result<Subscription, TransportError>;

    /// Publish a payload to a concrete topic.
    ///
    /// Success means the transport accepted the message, not that anyone
    /// received it.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Release a subscription before its handle is dropped.
    ///
    /// Returns `true` if the subscription existed. Transports that only
    /// notice dropped handles on their next delivery keep the default.
    async fn unsubscribe(&self, _id: SubscriptionId) -> bool {
        false
    }

    /// Get the transport name (e.g., "local", "mqtt").
    fn name(&self) -> &'static str;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId(7).to_string(), "sub_7");
    }

    #[tokio::test]
    async fn test_subscription_recv() {
        let (tx, rx) = mpsc::channel(4);
        let filter = TopicFilter::new("devices/#").unwrap();
        let mut sub = Subscription::new(SubscriptionId(1), filter, rx);

        assert!(sub.try_recv().is_none());
        tx.send(TransportMessage::new("devices/a/status", "{}"))
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "devices/a/status");

        drop(tx);
        assert!(sub.recv().await.is_none());
    }
}
