//! In-process topic broker.
//!
//! Delivery follows [`SubscriberTable`](crate::fanout): bounded queues,
//! at-most-once, a full queue drops the message for that subscriber.

use crate::fanout::SubscriberTable;
use crate::traits::{Subscription, SubscriptionId, Transport, TransportError, TransportMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_protocol::topic::validate_topic;
use tether_protocol::TopicFilter;
use tracing::{info, trace};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum payload size in bytes.
    pub max_payload_size: usize,
    /// Queue capacity per subscription.
    pub queue_capacity: usize,
    /// Maximum number of live subscriptions.
    pub max_subscriptions: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 64 * 1024,
            queue_capacity: 1024,
            max_subscriptions: 10_000,
        }
    }
}

/// An in-process pub/sub broker.
pub struct LocalBroker {
    subscriptions: SubscriberTable,
    closed: AtomicBool,
    config: BrokerConfig,
}

impl LocalBroker {
    /// Create a new broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a new broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating local broker with config: {:?}", config);
        Self {
            subscriptions: SubscriberTable::new(config.queue_capacity),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Subscribe without going through the async trait.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter is invalid, the broker is closed or
    /// the subscription limit is reached.
    pub fn subscribe_filter(&self, filter: &str) -> Result<Subscription, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let filter = TopicFilter::new(filter).map_err(TransportError::InvalidFilter)?;

        if self.subscriptions.len() >= self.config.max_subscriptions {
            self.prune_closed();
            if self.subscriptions.len() >= self.config.max_subscriptions {
                return Err(TransportError::MaxSubscriptionsReached);
            }
        }

        Ok(self.subscriptions.insert(filter))
    }

    /// Remove a subscription explicitly.
    ///
    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(id).is_some()
    }

    /// Publish a message and return how many subscribers it was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is closed, the topic is not a valid
    /// concrete topic, or the payload is too large.
    pub fn publish_message(&self, message: TransportMessage) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        validate_topic(&message.topic).map_err(TransportError::InvalidTopic)?;
        if message.payload.len() > self.config.max_payload_size {
            return Err(TransportError::PayloadTooLarge {
                size: message.payload.len(),
                max: self.config.max_payload_size,
            });
        }

        let delivered = self.subscriptions.deliver(&message);
        trace!(topic = %message.topic, recipients = delivered, "Published message");
        Ok(delivered)
    }

    /// Drop subscriptions whose receivers have gone away.
    ///
    /// Returns the number removed.
    pub fn prune_closed(&self) -> usize {
        self.subscriptions.prune_closed()
    }

    /// Shut the broker down. Every subscription stream ends.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.subscriptions.clear();
            info!("Local broker closed");
        }
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            subscription_count: self.subscriptions.len(),
            closed: self.closed.load(Ordering::Acquire),
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalBroker {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, TransportError> {
        self.subscribe_filter(filter)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.publish_message(TransportMessage::new(topic, payload))
            .map(|_| ())
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        LocalBroker::unsubscribe(self, id)
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

/// Broker statistics.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    /// Number of registered subscriptions.
    pub subscription_count: usize,
    /// Whether the broker has been closed.
    pub closed: bool,
}
