//! MQTT transport.
//!
//! Connects to an external MQTT 3.1.1 broker, the fabric field devices
//! already speak. One background task polls the `rumqttc` event loop,
//! resubscribes after every (re)connect and fans incoming publishes out to
//! local [`Subscription`]s. Everything is sent at QoS 0.

use crate::fanout::SubscriberTable;
use crate::traits::{Subscription, SubscriptionId, Transport, TransportError, TransportMessage};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::topic::validate_topic;
use tether_protocol::TopicFilter;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const QOS: QoS = QoS::AtMostOnce;

// Room for the fixed header and topic on top of the payload limit.
const PACKET_OVERHEAD: usize = 1024;

/// MQTT connection settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Keep-alive interval (at least one second).
    pub keep_alive: Duration,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password, sent only with a user name.
    pub password: Option<String>,
    /// Outgoing request queue between the client and the event loop.
    pub request_capacity: usize,
    /// Queue capacity per local subscription.
    pub queue_capacity: usize,
    /// Maximum payload size in bytes.
    pub max_payload_size: usize,
    /// Pause before polling again after a connection error.
    pub reconnect_delay: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: format!("tether-{}", std::process::id()),
            keep_alive: Duration::from_secs(30),
            username: None,
            password: None,
            request_capacity: 64,
            queue_capacity: 1024,
            max_payload_size: 64 * 1024,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl MqttConfig {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(1)));
        let max_packet = self.max_payload_size.saturating_add(PACKET_OVERHEAD);
        options.set_max_packet_size(max_packet, max_packet);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// State shared with the event loop task.
struct Shared {
    routes: SubscriberTable,
    connected: AtomicBool,
}

/// A [`Transport`] backed by an external MQTT broker.
pub struct MqttTransport {
    client: AsyncClient,
    shared: Arc<Shared>,
    closed: AtomicBool,
    config: MqttConfig,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttTransport {
    /// Create the client and start polling its event loop.
    ///
    /// Connecting happens in the background; until the broker acknowledges
    /// the connection, publishing fails and subscriptions are queued.
    #[must_use]
    pub fn start(config: MqttConfig) -> Self {
        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "Starting MQTT transport"
        );

        let (client, eventloop) = AsyncClient::new(config.options(), config.request_capacity.max(1));
        let shared = Arc::new(Shared {
            routes: SubscriberTable::new(config.queue_capacity),
            connected: AtomicBool::new(false),
        });

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&shared),
            config.reconnect_delay,
        ));

        Self {
            client,
            shared,
            closed: AtomicBool::new(false),
            config,
            event_loop: Some(task),
        }
    }

    /// Whether the broker has acknowledged the current connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Number of local subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared.routes.len()
    }

    /// Stop the event loop. Every subscription stream ends.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect request not queued");
        }
        if let Some(task) = &self.event_loop {
            task.abort();
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared.routes.clear();
        info!("MQTT transport closed");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let parsed = TopicFilter::new(filter).map_err(TransportError::InvalidFilter)?;

        let already_subscribed = self.shared.routes.has_filter(filter);
        let subscription = self.shared.routes.insert(parsed);
        if !already_subscribed {
            if let Err(e) = self.client.subscribe(filter, QOS).await {
                self.shared.routes.remove(subscription.id());
                return Err(TransportError::SendFailed(e.to_string()));
            }
        }
        Ok(subscription)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        validate_topic(topic).map_err(TransportError::InvalidTopic)?;
        if payload.len() > self.config.max_payload_size {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }
        if !self.is_connected() {
            return Err(TransportError::SendFailed(
                "not connected to MQTT broker".to_string(),
            ));
        }

        self.client
            .try_publish(topic, QOS, false, payload.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        trace!(topic = %topic, "Published to MQTT");
        Ok(())
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(filter) = self.shared.routes.remove(id) else {
            return false;
        };
        if !self.shared.routes.has_filter(filter.as_str()) {
            if let Err(e) = self.client.try_unsubscribe(filter.as_str()) {
                debug!(filter = %filter, error = %e, "MQTT unsubscribe not queued");
            }
        }
        true
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.is_connected()
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(event) => handle_event(&shared, &client, event),
            Err(e) => {
                if shared.connected.swap(false, Ordering::AcqRel) {
                    warn!(error = %e, "Lost connection to MQTT broker");
                } else {
                    debug!(error = %e, "MQTT connection attempt failed");
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

fn handle_event(shared: &Shared, client: &AsyncClient, event: Event) {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => {
            shared.connected.store(true, Ordering::Release);
            let filters = shared.routes.filters();
            info!(filters = filters.len(), "Connected to MQTT broker");
            // The session is not persistent, so filters are re-sent each time.
            for filter in filters {
                if let Err(e) = client.try_subscribe(filter.as_str(), QOS) {
                    warn!(filter = %filter, error = %e, "Failed to resubscribe");
                }
            }
        }
        Event::Incoming(Packet::Publish(publish)) => {
            let message = TransportMessage::new(publish.topic, publish.payload);
            let delivered = shared.routes.deliver(&message);
            trace!(topic = %message.topic, recipients = delivered, "MQTT message received");
        }
        Event::Incoming(packet) => trace!(?packet, "MQTT packet"),
        Event::Outgoing(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish};

    /// A transport whose event loop is driven by hand.
    fn manual() -> (MqttTransport, EventLoop) {
        let config = MqttConfig::default();
        let (client, eventloop) = AsyncClient::new(config.options(), 16);
        let transport = MqttTransport {
            client,
            shared: Arc::new(Shared {
                routes: SubscriberTable::new(config.queue_capacity),
                connected: AtomicBool::new(false),
            }),
            closed: AtomicBool::new(false),
            config,
            event_loop: None,
        };
        (transport, eventloop)
    }

    fn connack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)))
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let (transport, _eventloop) = manual();
        assert!(!transport.is_healthy());
        assert!(matches!(
            transport.publish("devices/lamp-1/commands", Bytes::from_static(b"{}")).await,
            Err(TransportError::SendFailed(_))
        ));

        handle_event(&transport.shared, &transport.client, connack());
        assert!(transport.is_healthy());
        transport
            .publish("devices/lamp-1/commands", Bytes::from_static(b"{}"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_validation() {
        let (transport, _eventloop) = manual();
        handle_event(&transport.shared, &transport.client, connack());

        assert!(matches!(
            transport.publish("devices/+/commands", Bytes::new()).await,
            Err(TransportError::InvalidTopic(_))
        ));
        let big = Bytes::from(vec![0u8; transport.config.max_payload_size + 1]);
        assert!(matches!(
            transport.publish("devices/lamp-1/commands", big).await,
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_incoming_publish_reaches_matching_subscriptions() {
        let (transport, _eventloop) = manual();
        let mut heartbeats = transport.subscribe("devices/+/heartbeat").await.unwrap();
        let mut responses = transport.subscribe("devices/+/responses").await.unwrap();

        let publish = Publish::new("devices/lamp-1/heartbeat", QoS::AtMostOnce, b"{}".to_vec());
        handle_event(
            &transport.shared,
            &transport.client,
            Event::Incoming(Packet::Publish(publish)),
        );

        let message = heartbeats.recv().await.unwrap();
        assert_eq!(message.topic, "devices/lamp-1/heartbeat");
        assert_eq!(&message.payload[..], b"{}");
        assert!(responses.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_bad_filter() {
        let (transport, _eventloop) = manual();
        assert!(matches!(
            transport.subscribe("devices/#/status").await,
            Err(TransportError::InvalidFilter(_))
        ));
        assert_eq!(transport.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let (transport, _eventloop) = manual();
        let sub = transport.subscribe("devices/+/status").await.unwrap();
        let mut other = transport.subscribe("devices/+/events").await.unwrap();

        assert!(transport.unsubscribe(sub.id()).await);
        assert!(!transport.unsubscribe(sub.id()).await);
        assert_eq!(transport.subscription_count(), 1);

        transport.close();
        assert!(other.recv().await.is_none());
        assert!(matches!(
            transport.subscribe("devices/+/status").await,
            Err(TransportError::Closed)
        ));
    }
}
