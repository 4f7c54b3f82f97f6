//! End-to-end bridge tests over the in-process broker with simulated devices.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{Bridge, BridgeConfig, BridgeError};
use tether_protocol::CommandEnvelope;
use tether_transport::{LocalBroker, Subscription, Transport, TransportError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

async fn start_bridge() -> (Bridge, Arc<LocalBroker>) {
    let broker = Arc::new(LocalBroker::new());
    let bridge = Bridge::start(broker.clone(), BridgeConfig::default())
        .await
        .unwrap();
    (bridge, broker)
}

async fn publish(broker: &LocalBroker, topic: &str, payload: Value) {
    broker
        .publish(topic, Bytes::from(serde_json::to_vec(&payload).unwrap()))
        .await
        .unwrap();
}

/// Poll until `check` holds; inbound messages are handled on background tasks.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// A relay controller that answers commands after `delay`.
fn spawn_device(broker: Arc<LocalBroker>, id: &'static str, delay: Duration) -> JoinHandle<()> {
    let mut commands = broker
        .subscribe_filter(&format!("devices/{}/commands", id))
        .unwrap();
    tokio::spawn(async move {
        let mut relay = "off";
        let mut voice = true;
        while let Some(message) = commands.recv().await {
            let envelope: CommandEnvelope = serde_json::from_slice(&message.payload).unwrap();
            tokio::time::sleep(delay).await;

            let response = match envelope.command.as_str() {
                "turn_on" => {
                    relay = "on";
                    json!({"requestId": envelope.request_id, "command": "turn_on", "success": true, "status": relay})
                }
                "turn_off" => {
                    relay = "off";
                    json!({"requestId": envelope.request_id, "command": "turn_off", "success": true, "status": relay})
                }
                "enable_voice" | "disable_voice" => {
                    voice = envelope.command == "enable_voice";
                    json!({"requestId": envelope.request_id, "success": true, "status": relay, "voice_enabled": voice})
                }
                "get_status" => json!({
                    "requestId": envelope.request_id,
                    "type": "status",
                    "status": relay,
                    "ip_address": "10.0.0.7",
                    "voice_enabled": voice,
                    "relay_pin": 5
                }),
                _ => json!({
                    "requestId": envelope.request_id,
                    "command": envelope.command,
                    "success": false,
                    "error": "Unknown command",
                    "status": relay
                }),
            };
            publish(&broker, &format!("devices/{}/responses", id), response).await;
        }
    })
}

#[tokio::test]
async fn heartbeat_lists_device_online() {
    let (bridge, broker) = start_bridge().await;

    publish(
        &broker,
        "devices/lamp-1/heartbeat",
        json!({"name": "Lamp", "status": "off"}),
    )
    .await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    let devices = bridge.list_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "lamp-1");
    assert_eq!(devices[0].status.as_deref(), Some("off"));
    assert!(devices[0].online);
}

#[tokio::test]
async fn registration_metadata_survives_sparse_heartbeats() {
    let (bridge, broker) = start_bridge().await;

    publish(
        &broker,
        "devices/lamp-1/heartbeat",
        json!({
            "deviceId": "lamp-1",
            "type": "registration",
            "name": "Lamp",
            "ip": "10.0.0.7",
            "capabilities": ["relay_control", "voice_commands", "audio_feedback"]
        }),
    )
    .await;
    publish(&broker, "devices/lamp-1/heartbeat", json!({"status": "on"})).await;
    eventually(|| bridge.stats().heartbeats == 2).await;

    let device = bridge.get_device("lamp-1").unwrap();
    assert_eq!(device.name.as_deref(), Some("Lamp"));
    assert_eq!(device.capabilities.len(), 3);
    assert_eq!(device.status.as_deref(), Some("on"));
}

#[tokio::test]
async fn dispatch_unknown_device() {
    let (bridge, _broker) = start_bridge().await;
    let result = bridge
        .dispatch("nobody", "turn_on", Duration::from_secs(1))
        .await;
    assert_eq!(result, Err(BridgeError::DeviceNotFound("nobody".into())));
}

#[tokio::test]
async fn dispatch_answered_before_deadline() {
    let (bridge, broker) = start_bridge().await;
    let _device = spawn_device(broker.clone(), "lamp-1", Duration::from_millis(200));
    publish(&broker, "devices/lamp-1/heartbeat", json!({"name": "Lamp"})).await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    let started = Instant::now();
    let reply = bridge
        .dispatch("lamp-1", "turn_on", Duration::from_millis(5000))
        .await
        .unwrap();

    assert_eq!(reply.status.as_deref(), Some("on"));
    assert_eq!(reply.device_id, "lamp-1");
    assert!(started.elapsed() < Duration::from_millis(5000));
    assert!(bridge.correlation().is_empty());
}

#[tokio::test]
async fn status_query_returns_device_state() {
    let (bridge, broker) = start_bridge().await;
    let _device = spawn_device(broker.clone(), "lamp-1", Duration::ZERO);
    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    let reply = bridge
        .dispatch("lamp-1", "get_status", Duration::from_secs(2))
        .await
        .unwrap();

    let state = reply.state.unwrap();
    assert_eq!(state.address.as_deref(), Some("10.0.0.7"));
    assert_eq!(state.voice_enabled, Some(true));
    assert_eq!(reply.details.get("relay_pin"), Some(&json!(5)));
}

#[tokio::test]
async fn device_error_is_command_failure() {
    let (bridge, broker) = start_bridge().await;
    let _device = spawn_device(broker.clone(), "lamp-1", Duration::ZERO);
    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    match bridge
        .dispatch("lamp-1", "self_destruct", Duration::from_secs(2))
        .await
    {
        Err(BridgeError::CommandFailure { message, .. }) => assert_eq!(message, "Unknown command"),
        other => panic!("Expected command failure, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn silent_device_times_out() {
    let (bridge, broker) = start_bridge().await;
    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    let started = Instant::now();
    let result = bridge
        .dispatch("lamp-1", "turn_on", Duration::from_millis(5000))
        .await;

    assert!(matches!(result, Err(BridgeError::Timeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(5000));
    assert!(bridge.correlation().is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_response_after_timeout_is_ignored() {
    let (bridge, broker) = start_bridge().await;
    let _device = spawn_device(broker.clone(), "lamp-1", Duration::from_secs(3));
    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    let result = bridge
        .dispatch("lamp-1", "turn_on", Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(BridgeError::Timeout { .. })));

    // The device still acts on the command and answers late.
    tokio::time::sleep(Duration::from_secs(3)).await;
    eventually(|| bridge.stats().late_responses == 1).await;
    assert_eq!(bridge.stats().responses, 0);
}

#[tokio::test(start_paused = true)]
async fn stale_device_is_offline_without_publish() {
    let (bridge, broker) = start_bridge().await;
    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    let mut commands = broker.subscribe_filter("devices/+/commands").unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let result = bridge
        .dispatch("lamp-1", "turn_on", Duration::from_secs(5))
        .await;
    assert_eq!(result, Err(BridgeError::DeviceOffline("lamp-1".into())));
    assert!(commands.try_recv().is_none());
    assert!(bridge.correlation().is_empty());

    // The sweeper flips the flag at its next tick (90s).
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!bridge.get_device("lamp-1").unwrap().online);
    assert_eq!(bridge.stats().devices_online, 0);
}

#[tokio::test(start_paused = true)]
async fn offline_device_recovers_on_heartbeat() {
    let (bridge, broker) = start_bridge().await;
    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    tokio::time::sleep(Duration::from_secs(91)).await;
    assert!(!bridge.get_device("lamp-1").unwrap().online);

    let _device = spawn_device(broker.clone(), "lamp-1", Duration::ZERO);
    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    eventually(|| bridge.get_device("lamp-1").unwrap().online).await;

    let reply = bridge
        .dispatch("lamp-1", "turn_off", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.status.as_deref(), Some("off"));
}

#[tokio::test]
async fn concurrent_commands_each_get_their_own_answer() {
    let (bridge, broker) = start_bridge().await;
    let _device = spawn_device(broker.clone(), "lamp-1", Duration::from_millis(20));
    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    let timeout = Duration::from_secs(2);
    let (status, voice) = tokio::join!(
        bridge.dispatch("lamp-1", "get_status", timeout),
        bridge.dispatch("lamp-1", "disable_voice", timeout),
    );

    assert_eq!(status.unwrap().command, "get_status");
    assert_eq!(voice.unwrap().command, "disable_voice");
    assert!(bridge.correlation().is_empty());
}

#[tokio::test]
async fn voice_event_is_surfaced_and_never_correlated() {
    let (bridge, broker) = start_bridge().await;
    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    eventually(|| bridge.get_device("lamp-1").is_some()).await;
    let mut events = bridge.subscribe_events();

    publish(
        &broker,
        "devices/lamp-1/audio",
        json!({
            "voiceCommand": "turn on the light",
            "action": "turn_on",
            "source": "voice",
            "requestId": "voice_1234"
        }),
    )
    .await;

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.device_id, "lamp-1");
    assert_eq!(event.payload.action.as_deref(), Some("turn_on"));
    assert_eq!(bridge.stats().responses, 0);
}

#[tokio::test]
async fn malformed_traffic_is_dropped() {
    let (bridge, broker) = start_bridge().await;

    broker
        .publish("devices/lamp-1/heartbeat", Bytes::from_static(b"\x00\xffgarbage"))
        .await
        .unwrap();
    broker
        .publish("devices/lamp-1/responses", Bytes::from_static(b"{\"status\":\"on\"}"))
        .await
        .unwrap();
    publish(&broker, "devices/lamp-1/status", json!({"status": "on"})).await;

    eventually(|| bridge.stats().discarded == 2).await;
    eventually(|| bridge.stats().statuses == 1).await;
    assert!(bridge.list_devices().is_empty());
}

/// Accepts subscriptions from a real broker but refuses every publish.
struct BrokenUplink {
    inner: LocalBroker,
    attempts: AtomicUsize,
}

#[async_trait]
impl Transport for BrokenUplink {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, TransportError> {
        self.inner.subscribe(filter).await
    }

    async fn publish(&self, topic: &str, _payload: Bytes) -> Result<(), TransportError> {
        if topic.ends_with("/commands") {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::SendFailed("uplink down".into()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

#[tokio::test]
async fn publish_failure_resolves_without_waiting() {
    let uplink = Arc::new(BrokenUplink {
        inner: LocalBroker::new(),
        attempts: AtomicUsize::new(0),
    });
    let bridge = Bridge::start(uplink.clone(), BridgeConfig::default())
        .await
        .unwrap();

    uplink
        .inner
        .publish("devices/lamp-1/heartbeat", Bytes::from_static(b"{}"))
        .await
        .unwrap();
    eventually(|| bridge.get_device("lamp-1").is_some()).await;

    let started = Instant::now();
    let result = bridge
        .dispatch("lamp-1", "turn_on", Duration::from_secs(30))
        .await;

    assert!(matches!(result, Err(BridgeError::PublishFailure(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(uplink.attempts.load(Ordering::SeqCst), 1);
    assert!(bridge.correlation().is_empty());
}

/// Remembers every filter the bridge asks for.
struct RecordingTransport {
    inner: LocalBroker,
    filters: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, TransportError> {
        self.filters.lock().unwrap().push(filter.to_string());
        self.inner.subscribe(filter).await
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.inner.publish(topic, payload).await
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[tokio::test]
async fn bridge_subscribes_to_every_inbound_topic() {
    let transport = Arc::new(RecordingTransport {
        inner: LocalBroker::new(),
        filters: Mutex::new(Vec::new()),
    });
    let bridge = Bridge::start(transport.clone(), BridgeConfig::default())
        .await
        .unwrap();

    let mut filters = transport.filters.lock().unwrap().clone();
    filters.sort();
    assert_eq!(
        filters,
        vec![
            "devices/+/audio",
            "devices/+/events",
            "devices/+/heartbeat",
            "devices/+/responses",
            "devices/+/status",
        ]
    );
    bridge.shutdown();
}

#[tokio::test]
async fn shutdown_stops_listening() {
    let (bridge, broker) = start_bridge().await;
    bridge.shutdown();
    tokio::task::yield_now().await;

    publish(&broker, "devices/lamp-1/heartbeat", json!({})).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.get_device("lamp-1").is_none());
}
