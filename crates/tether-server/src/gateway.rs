//! WebSocket device gateway.
//!
//! Lets devices reach the bridge's transport over a WebSocket. A session can
//! subscribe to topic filters (typically its own `commands` topic) and
//! publish heartbeats, status reports, responses and events.
//!
//! Each session forwards through a bounded queue; when a slow client lets
//! it fill up, further messages for that session are dropped.
//!
//! Text messages carry JSON frames; binary messages carry length-prefixed
//! MessagePack frames. Replies use the encoding of the last inbound frame.

use crate::metrics::{self, SessionMetricsGuard};
use crate::server::AppState;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use bytes::{Bytes, BytesMut};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tether_protocol::frames::error_codes;
use tether_protocol::{codec, Frame, PROTOCOL_MAJOR};
use tether_transport::{Subscription, SubscriptionId, Transport, TransportMessage};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wire encoding of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Text,
    Binary,
}

/// Per-session state.
struct Session {
    id: String,
    client_id: Option<String>,
    encoding: Encoding,
    subscriptions: HashMap<String, (SubscriptionId, JoinHandle<()>)>,
    forward_tx: mpsc::Sender<TransportMessage>,
}

impl Session {
    async fn close(&mut self, state: &AppState) {
        for (_, (id, task)) in self.subscriptions.drain() {
            task.abort();
            state.transport.unsubscribe(id).await;
        }
    }
}

type WsSink = SplitSink<WebSocket, Message>;

/// Move messages from a transport subscription into a session queue.
///
/// Never blocks on the session: a full queue drops the message.
fn spawn_forwarder(
    mut subscription: Subscription,
    tx: mpsc::Sender<TransportMessage>,
    session_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = subscription.recv().await {
            match tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    warn!(
                        session = %session_id,
                        topic = %message.topic,
                        "Session queue full, dropping message"
                    );
                    metrics::record_error("session_queue_full");
                }
                Err(TrySendError::Closed(_)) => break, // Session gone
            }
        }
    })
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let max = state.config.gateway.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a device session.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = SessionMetricsGuard::new();

    let capacity = state.config.gateway.forward_queue_capacity.max(1);
    let (forward_tx, mut forward_rx) = mpsc::channel::<TransportMessage>(capacity);
    let mut session = Session {
        id: state.next_session_id(),
        client_id: None,
        encoding: Encoding::Text,
        subscriptions: HashMap::new(),
        forward_tx,
    };

    debug!(session = %session.id, "Gateway session opened");

    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            // Broker messages matching this session's subscriptions
            Some(message) = forward_rx.recv() => {
                let payload = serde_json::from_slice(&message.payload).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&message.payload).into_owned())
                });
                let frame = Frame::publish(message.topic, payload);
                if send_frame(&mut sender, &frame, session.encoding).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.encoding = Encoding::Text;
                        let result = match codec::decode_text(&text) {
                            Ok(frame) => handle_frame(frame, &mut session, &state, &mut sender).await,
                            Err(e) => reject(&mut sender, &session, e.to_string()).await,
                        };
                        if result.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        session.encoding = Encoding::Binary;
                        read_buffer.extend_from_slice(&data);

                        let mut failed = false;
                        loop {
                            let result = match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    handle_frame(frame, &mut session, &state, &mut sender).await
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    // The stream is out of sync; start over.
                                    read_buffer.clear();
                                    reject(&mut sender, &session, e.to_string()).await
                                }
                            };
                            if result.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session.id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session.id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session.id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    session.close(&state).await;
    debug!(
        session = %session.id,
        client = ?session.client_id,
        "Gateway session closed"
    );
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    session: &mut Session,
    state: &AppState,
    sender: &mut WsSink,
) -> Result<()> {
    metrics::record_frame("inbound");

    match frame {
        Frame::Connect { version, client_id } => {
            if version != PROTOCOL_MAJOR {
                warn!(session = %session.id, version, "Unsupported protocol version");
                let reply = Frame::error(
                    0,
                    error_codes::UNSUPPORTED_VERSION,
                    format!(
                        "Unsupported protocol version {}, expected {}",
                        version, PROTOCOL_MAJOR
                    ),
                );
                send_frame(sender, &reply, session.encoding).await?;
                return Ok(());
            }

            info!(session = %session.id, client = ?client_id, "Device connected to gateway");
            session.client_id = client_id;
            let keepalive = u32::try_from(state.config.gateway.keepalive_interval_ms)
                .unwrap_or(u32::MAX);
            let reply = Frame::connected(&session.id, PROTOCOL_MAJOR, keepalive);
            send_frame(sender, &reply, session.encoding).await?;
        }

        Frame::Subscribe { id, topic } => {
            debug!(session = %session.id, filter = %topic, "Subscribe request");

            if session.subscriptions.contains_key(&topic) {
                return send_frame(sender, &Frame::ack(id), session.encoding).await;
            }

            let reply = match state.transport.subscribe(&topic).await {
                Ok(subscription) => {
                    let sub_id = subscription.id();
                    let task = spawn_forwarder(
                        subscription,
                        session.forward_tx.clone(),
                        session.id.clone(),
                    );
                    session.subscriptions.insert(topic, (sub_id, task));
                    Frame::ack(id)
                }
                Err(e) => {
                    warn!(session = %session.id, error = %e, "Subscribe failed");
                    Frame::error(id, error_codes::INVALID_FILTER, e.to_string())
                }
            };
            send_frame(sender, &reply, session.encoding).await?;
        }

        Frame::Unsubscribe { id, topic } => {
            debug!(session = %session.id, filter = %topic, "Unsubscribe request");

            let reply = match session.subscriptions.remove(&topic) {
                Some((sub_id, task)) => {
                    task.abort();
                    state.transport.unsubscribe(sub_id).await;
                    Frame::ack(id)
                }
                None => Frame::error(
                    id,
                    error_codes::NOT_SUBSCRIBED,
                    format!("Not subscribed to {}", topic),
                ),
            };
            send_frame(sender, &reply, session.encoding).await?;
        }

        Frame::Publish { id, topic, payload } => {
            let body = Bytes::from(serde_json::to_vec(&payload)?);
            match state.transport.publish(&topic, body).await {
                Ok(()) => {
                    debug!(session = %session.id, topic = %topic, "Published");
                    if let Some(req_id) = id {
                        send_frame(sender, &Frame::ack(req_id), session.encoding).await?;
                    }
                }
                Err(e) => {
                    warn!(session = %session.id, topic = %topic, error = %e, "Publish rejected");
                    metrics::record_error("publish_rejected");
                    let reply = Frame::error(
                        id.unwrap_or(0),
                        error_codes::PUBLISH_REJECTED,
                        e.to_string(),
                    );
                    send_frame(sender, &reply, session.encoding).await?;
                }
            }
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(timestamp), session.encoding).await?;
        }

        Frame::Pong { .. } => {}

        other => {
            warn!(session = %session.id, frame_type = ?other.frame_type(), "Unexpected frame type");
        }
    }

    Ok(())
}

/// Answer an undecodable frame without dropping the session.
async fn reject(sender: &mut WsSink, session: &Session, reason: String) -> Result<()> {
    warn!(session = %session.id, error = %reason, "Invalid frame");
    metrics::record_error("invalid_frame");
    let reply = Frame::error(0, error_codes::INVALID_FRAME, reason);
    send_frame(sender, &reply, session.encoding).await
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSink, frame: &Frame, encoding: Encoding) -> Result<()> {
    let message = match encoding {
        Encoding::Text => Message::Text(codec::encode_text(frame)?),
        Encoding::Binary => Message::Binary(codec::encode(frame)?.to_vec()),
    };
    metrics::record_frame("outbound");
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_transport::LocalBroker;

    fn heartbeat(n: u32) -> TransportMessage {
        TransportMessage::new("devices/lamp-1/heartbeat", format!("{{\"n\":{}}}", n))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_full_session_queue_drops_instead_of_growing() {
        let broker = LocalBroker::new();
        let subscription = broker.subscribe_filter("devices/+/heartbeat").unwrap();
        let (tx, mut rx) = mpsc::channel(2);
        let task = spawn_forwarder(subscription, tx, "s-1".to_string());

        for n in 0..5 {
            broker.publish_message(heartbeat(n)).unwrap();
        }
        settle().await;

        assert_eq!(&rx.recv().await.unwrap().payload[..], b"{\"n\":0}");
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"{\"n\":1}");
        assert!(rx.try_recv().is_err());

        // Still forwarding once the session catches up.
        broker.publish_message(heartbeat(9)).unwrap();
        settle().await;
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"{\"n\":9}");
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_forwarder_stops_when_session_closes() {
        let broker = LocalBroker::new();
        let subscription = broker.subscribe_filter("devices/+/heartbeat").unwrap();
        let (tx, rx) = mpsc::channel(2);
        let task = spawn_forwarder(subscription, tx, "s-1".to_string());

        drop(rx);
        broker.publish_message(heartbeat(0)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
