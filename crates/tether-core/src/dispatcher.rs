//! Command dispatch.
//!
//! Turns one asynchronous publish into one awaited result: either the
//! device's matching response, or an error once the deadline passes.

use crate::correlation::{
    completion, generate_request_id, CorrelationTable, Outcome, PendingRequest,
};
use crate::error::BridgeError;
use crate::presence::PresenceStore;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{CommandEnvelope, Topic};
use tether_transport::Transport;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Longest wait honoured for a single command; longer timeouts are capped.
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Publishes commands and waits for their correlated responses.
pub struct Dispatcher {
    presence: Arc<PresenceStore>,
    table: Arc<CorrelationTable>,
    transport: Arc<dyn Transport>,
    staleness_threshold: Duration,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// Devices silent for longer than `staleness_threshold` are treated as
    /// offline even if the presence sweeper has not demoted them yet.
    #[must_use]
    pub fn new(
        presence: Arc<PresenceStore>,
        table: Arc<CorrelationTable>,
        transport: Arc<dyn Transport>,
        staleness_threshold: Duration,
    ) -> Self {
        Self {
            presence,
            table,
            transport,
            staleness_threshold,
        }
    }

    /// Send `command` to `device_id` and wait up to `timeout` for the answer.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::DeviceNotFound`] / [`BridgeError::DeviceOffline`]
    ///   before anything is published.
    /// - [`BridgeError::PublishFailure`] if the transport rejects the command.
    /// - [`BridgeError::Timeout`] if no response arrives in time.
    /// - [`BridgeError::CommandFailure`] if the device reports an error.
    pub async fn dispatch(&self, device_id: &str, command: &str, timeout: Duration) -> Outcome {
        let now = Instant::now();
        let device = self
            .presence
            .get(device_id)
            .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))?;
        if !device.online || device.is_stale(now, self.staleness_threshold) {
            debug!(device = %device_id, command = %command, "Dispatch to offline device refused");
            return Err(BridgeError::DeviceOffline(device_id.to_string()));
        }

        let request_id = generate_request_id();
        let timeout = timeout.min(MAX_COMMAND_TIMEOUT);
        let deadline = now.checked_add(timeout).unwrap_or(now);
        let (handle, mut waiter) = completion();
        self.table.register(
            request_id.clone(),
            PendingRequest::new(device_id, command, handle, deadline),
        )?;

        let envelope = CommandEnvelope::new(command, request_id.clone());
        let topic = Topic::commands(device_id).to_string();
        let published = match serde_json::to_vec(&envelope) {
            Ok(payload) => self
                .transport
                .publish(&topic, payload.into())
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match published {
            Ok(()) => debug!(
                request_id = %request_id,
                device = %device_id,
                command = %command,
                "Command published"
            ),
            Err(reason) => {
                warn!(request_id = %request_id, device = %device_id, error = %reason, "Publish failed");
                self.table
                    .complete(&request_id, Err(BridgeError::PublishFailure(reason)));
            }
        }

        let outcome = match tokio::time::timeout_at(deadline, waiter.recv()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Either this expiry wins, or a response slipped in first and
                // is already waiting.
                self.table.expire(&request_id);
                waiter.recv().await
            }
        };

        outcome.unwrap_or_else(|| {
            Err(BridgeError::Timeout {
                request_id,
                device: device_id.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::CommandReply;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use tether_protocol::HeartbeatPayload;
    use tether_transport::{Subscription, TransportError};

    /// Records publishes; optionally rejects them.
    #[derive(Default)]
    struct RecordingTransport {
        published: Mutex<Vec<(String, Bytes)>>,
        reject: bool,
    }

    impl RecordingTransport {
        fn published(&self) -> Vec<(String, Bytes)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn subscribe(&self, _filter: &str) -> Result<Subscription, TransportError> {
            Err(TransportError::Other("not supported".into()))
        }

        async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
            if self.reject {
                return Err(TransportError::SendFailed("broker unreachable".into()));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct Fixture {
        presence: Arc<PresenceStore>,
        table: Arc<CorrelationTable>,
        transport: Arc<RecordingTransport>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(reject: bool) -> Fixture {
        let presence = Arc::new(PresenceStore::new());
        let table = Arc::new(CorrelationTable::new());
        let transport = Arc::new(RecordingTransport {
            reject,
            ..Default::default()
        });
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&presence),
            Arc::clone(&table),
            transport.clone(),
            Duration::from_secs(60),
        ));
        Fixture {
            presence,
            table,
            transport,
            dispatcher,
        }
    }

    fn request_id_of(payload: &Bytes) -> String {
        let envelope: CommandEnvelope = serde_json::from_slice(payload).unwrap();
        envelope.request_id
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let fx = fixture(false);
        let result = fx
            .dispatcher
            .dispatch("ghost", "turn_on", Duration::from_secs(5))
            .await;
        assert_eq!(result, Err(BridgeError::DeviceNotFound("ghost".into())));
        assert!(fx.transport.published().is_empty());
        assert!(fx.table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_device_is_never_published_to() {
        let fx = fixture(false);
        fx.presence
            .upsert("lamp-1", &HeartbeatPayload::default())
            .unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let result = fx
            .dispatcher
            .dispatch("lamp-1", "turn_on", Duration::from_secs(5))
            .await;
        assert_eq!(result, Err(BridgeError::DeviceOffline("lamp-1".into())));
        assert!(fx.transport.published().is_empty());
        assert!(fx.table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_is_capped() {
        let fx = fixture(false);
        fx.presence
            .upsert("lamp-1", &HeartbeatPayload::default())
            .unwrap();

        let started = Instant::now();
        let result = fx
            .dispatcher
            .dispatch("lamp-1", "turn_on", Duration::MAX)
            .await;

        match result {
            Err(BridgeError::Timeout { timeout_ms, .. }) => {
                assert_eq!(timeout_ms, 3_600_000);
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() >= MAX_COMMAND_TIMEOUT);
        assert!(fx.table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let fx = fixture(false);
        fx.presence
            .upsert("lamp-1", &HeartbeatPayload::default())
            .unwrap();

        let started = Instant::now();
        let result = fx
            .dispatcher
            .dispatch("lamp-1", "turn_on", Duration::from_millis(5000))
            .await;

        assert!(matches!(
            result,
            Err(BridgeError::Timeout { timeout_ms: 5000, .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert!(fx.table.is_empty());

        let published = fx.transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "devices/lamp-1/commands");
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_completes_before_deadline() {
        let fx = fixture(false);
        fx.presence
            .upsert("lamp-1", &HeartbeatPayload::default())
            .unwrap();

        let dispatcher = Arc::clone(&fx.dispatcher);
        let call = tokio::spawn(async move {
            dispatcher
                .dispatch("lamp-1", "turn_on", Duration::from_millis(5000))
                .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let published = fx.transport.published();
        let request_id = request_id_of(&published[0].1);
        let reply = CommandReply::ack(request_id.clone(), "lamp-1", "turn_on", Some("on".into()));
        assert!(fx.table.complete(&request_id, Ok(reply)));

        let started = Instant::now();
        let result = call.await.unwrap().unwrap();
        assert_eq!(result.status.as_deref(), Some("on"));
        assert!(started.elapsed() < Duration::from_millis(4800));
    }

    #[tokio::test]
    async fn test_publish_failure_resolves_immediately() {
        let fx = fixture(true);
        fx.presence
            .upsert("lamp-1", &HeartbeatPayload::default())
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            fx.dispatcher
                .dispatch("lamp-1", "turn_on", Duration::from_secs(30)),
        )
        .await
        .expect("publish failure must not wait for the deadline");

        assert!(matches!(result, Err(BridgeError::PublishFailure(_))));
        assert!(fx.table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_to_one_device() {
        let fx = fixture(false);
        fx.presence
            .upsert("lamp-1", &HeartbeatPayload::default())
            .unwrap();

        let first = {
            let d = Arc::clone(&fx.dispatcher);
            tokio::spawn(async move { d.dispatch("lamp-1", "turn_on", Duration::from_secs(5)).await })
        };
        let second = {
            let d = Arc::clone(&fx.dispatcher);
            tokio::spawn(async move { d.dispatch("lamp-1", "get_status", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.table.len(), 2);

        for (_, payload) in fx.transport.published() {
            let envelope: CommandEnvelope = serde_json::from_slice(&payload).unwrap();
            let reply = CommandReply::ack(
                envelope.request_id.clone(),
                "lamp-1",
                envelope.command.clone(),
                None,
            );
            assert!(fx.table.complete(&envelope.request_id, Ok(reply)));
        }

        assert_eq!(first.await.unwrap().unwrap().command, "turn_on");
        assert_eq!(second.await.unwrap().unwrap().command, "get_status");
    }
}
