//! Inbound message classification.
//!
//! Every message a device publishes passes through [`Classifier::on_message`]
//! exactly once. Malformed input is expected on shared transports, so it is
//! logged and dropped; it never reaches a waiting caller.

use crate::correlation::CorrelationTable;
use crate::error::BridgeError;
use crate::presence::PresenceStore;
use crate::reply::CommandReply;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tether_protocol::envelope::now_millis;
use tether_protocol::{EventPayload, HeartbeatPayload, ResponseEnvelope, Topic, TopicKind};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// An out-of-band device notification, such as a voice trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    /// Originating device.
    pub device_id: String,
    /// Receive time, milliseconds since the Unix epoch.
    pub received_at: u64,
    /// Event body.
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Why a message was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Topic is not a device topic.
    UnknownTopic,
    /// Payload is not a JSON object.
    NotStructured,
    /// Payload is a JSON object of the wrong shape.
    InvalidPayload,
    /// Response without a request id.
    MissingRequestId,
    /// Our own command echoed back by the transport.
    OutboundCommand,
    /// Unrecognised message kind.
    UnknownKind(String),
}

impl DiscardReason {
    /// Short name for logs and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::UnknownTopic => "unknown_topic",
            DiscardReason::NotStructured => "not_structured",
            DiscardReason::InvalidPayload => "invalid_payload",
            DiscardReason::MissingRequestId => "missing_request_id",
            DiscardReason::OutboundCommand => "outbound_command",
            DiscardReason::UnknownKind(_) => "unknown_kind",
        }
    }
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Heartbeat or registration applied to the presence store.
    Heartbeat,
    /// Status report; `recorded` is false if the device was unknown.
    Status {
        /// Whether the report was applied.
        recorded: bool,
    },
    /// Command response; `completed` is false for late or foreign responses.
    Response {
        /// Whether a waiting caller was completed.
        completed: bool,
    },
    /// Device event surfaced to listeners.
    Event,
    /// Dropped.
    Discarded(DiscardReason),
}

impl Classified {
    /// Short name for logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Classified::Heartbeat => "heartbeat",
            Classified::Status { .. } => "status",
            Classified::Response { .. } => "response",
            Classified::Event => "event",
            Classified::Discarded(_) => "discarded",
        }
    }
}

/// Routes inbound device messages to the presence store and correlation table.
pub struct Classifier {
    presence: Arc<PresenceStore>,
    table: Arc<CorrelationTable>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Classifier {
    /// Create a classifier whose events are broadcast with `event_capacity`
    /// slots of backlog per listener.
    #[must_use]
    pub fn new(
        presence: Arc<PresenceStore>,
        table: Arc<CorrelationTable>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            presence,
            table,
            events,
        }
    }

    /// Listen for device events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Classify and apply one inbound message.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> Classified {
        let classified = self.classify(topic, payload);
        match &classified {
            Classified::Discarded(reason) => {
                debug!(topic = %topic, reason = reason.as_str(), "Message discarded")
            }
            other => trace!(topic = %topic, kind = other.kind(), "Message classified"),
        }
        classified
    }

    fn classify(&self, topic: &str, payload: &[u8]) -> Classified {
        let Some(topic) = Topic::parse(topic) else {
            return Classified::Discarded(DiscardReason::UnknownTopic);
        };

        let device_id = topic.device_id();
        let handler: fn(&Self, &str, Value) -> Classified = match topic.kind() {
            TopicKind::Heartbeat => Self::on_heartbeat,
            TopicKind::Status => Self::on_status,
            TopicKind::Responses => Self::on_response,
            TopicKind::Events => Self::on_event,
            TopicKind::Commands => return Classified::Discarded(DiscardReason::OutboundCommand),
            TopicKind::Other(kind) => {
                warn!(device = %device_id, kind = %kind, "Unknown message kind");
                return Classified::Discarded(DiscardReason::UnknownKind(kind.clone()));
            }
        };

        match serde_json::from_slice::<Value>(payload) {
            Ok(value @ Value::Object(_)) => handler(self, device_id, value),
            _ => Classified::Discarded(DiscardReason::NotStructured),
        }
    }

    fn on_heartbeat(&self, device_id: &str, value: Value) -> Classified {
        let Ok(heartbeat) = serde_json::from_value::<HeartbeatPayload>(value) else {
            warn!(device = %device_id, "Malformed heartbeat");
            return Classified::Discarded(DiscardReason::InvalidPayload);
        };
        if let Some(claimed) = heartbeat.device_id.as_deref() {
            if claimed != device_id {
                warn!(device = %device_id, claimed = %claimed, "Heartbeat device id does not match topic");
            }
        }

        match self.presence.upsert(device_id, &heartbeat) {
            Ok(_) => Classified::Heartbeat,
            Err(e) => {
                warn!(device = %device_id, error = %e, "Heartbeat rejected");
                Classified::Discarded(DiscardReason::InvalidPayload)
            }
        }
    }

    fn on_status(&self, device_id: &str, value: Value) -> Classified {
        let Ok(report) = serde_json::from_value::<HeartbeatPayload>(value) else {
            warn!(device = %device_id, "Malformed status report");
            return Classified::Discarded(DiscardReason::InvalidPayload);
        };
        Classified::Status {
            recorded: self.presence.record_status(device_id, &report),
        }
    }

    fn on_response(&self, device_id: &str, value: Value) -> Classified {
        let Ok(response) = serde_json::from_value::<ResponseEnvelope>(value) else {
            warn!(device = %device_id, "Malformed response");
            return Classified::Discarded(DiscardReason::InvalidPayload);
        };
        let Some(request_id) = response.request_id.as_deref().filter(|id| !id.is_empty()) else {
            return Classified::Discarded(DiscardReason::MissingRequestId);
        };

        let Some(context) = self.table.context(request_id) else {
            debug!(device = %device_id, request_id = %request_id, "Late or unknown response");
            return Classified::Response { completed: false };
        };
        if context.device_id != device_id {
            warn!(
                device = %device_id,
                expected = %context.device_id,
                request_id = %request_id,
                "Response from unexpected device ignored"
            );
            return Classified::Response { completed: false };
        }

        let outcome = if response.is_success() {
            Ok(CommandReply::from_response(
                request_id,
                device_id,
                &context.command,
                &response,
            ))
        } else {
            Err(BridgeError::CommandFailure {
                request_id: request_id.to_string(),
                device: device_id.to_string(),
                message: response
                    .error
                    .clone()
                    .filter(|message| !message.is_empty())
                    .unwrap_or_else(|| "command reported failure".to_string()),
                status: response.status.clone(),
            })
        };

        Classified::Response {
            completed: self.table.complete(request_id, outcome),
        }
    }

    fn on_event(&self, device_id: &str, value: Value) -> Classified {
        let Ok(payload) = serde_json::from_value::<EventPayload>(value) else {
            warn!(device = %device_id, "Malformed event");
            return Classified::Discarded(DiscardReason::InvalidPayload);
        };

        if self.presence.touch(device_id).is_none() {
            debug!(device = %device_id, "Event from unregistered device");
        }
        debug!(
            device = %device_id,
            source = ?payload.source,
            action = ?payload.action,
            "Device event"
        );

        let event = DeviceEvent {
            device_id: device_id.to_string(),
            received_at: now_millis(),
            payload,
        };
        // No listeners is fine.
        let _ = self.events.send(event);
        Classified::Event
    }
}
