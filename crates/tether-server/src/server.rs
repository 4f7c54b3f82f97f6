//! Server wiring.
//!
//! Builds the shared state (transport + bridge), the HTTP router, and runs
//! everything until shutdown.

use crate::config::Config;
use crate::{api, gateway, metrics};
use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::Bridge;
use tether_transport::{LocalBroker, MqttTransport, Transport, TransportError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// How often bridge statistics are pushed to the metrics recorder.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The bridge.
    pub bridge: Bridge,
    /// The transport the bridge and gateway sessions use.
    pub transport: Arc<dyn Transport>,
    /// The embedded broker, when no external MQTT broker is configured.
    pub broker: Option<Arc<LocalBroker>>,
    /// Server configuration.
    pub config: Config,
    mqtt: Option<Arc<MqttTransport>>,
    next_session: AtomicU64,
}

impl AppState {
    /// Pick the transport and start the bridge on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge cannot subscribe to device topics.
    pub async fn start(config: Config) -> Result<Self, TransportError> {
        let mut broker = None;
        let mut mqtt = None;
        let transport: Arc<dyn Transport> = if config.mqtt.enabled {
            let client = Arc::new(MqttTransport::start(config.mqtt_config()));
            mqtt = Some(Arc::clone(&client));
            client
        } else {
            let local = Arc::new(LocalBroker::with_config(config.broker_config()));
            broker = Some(Arc::clone(&local));
            local
        };
        info!(transport = transport.name(), "Device transport selected");

        let bridge = Bridge::start(Arc::clone(&transport), config.bridge_config()).await?;

        Ok(Self {
            bridge,
            transport,
            broker,
            config,
            mqtt,
            next_session: AtomicU64::new(1),
        })
    }

    /// Allocate a gateway session identifier.
    pub fn next_session_id(&self) -> String {
        format!("session_{}", self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Stop the bridge and close the transport.
    pub fn shutdown(&self) {
        self.bridge.shutdown();
        if let Some(broker) = &self.broker {
            broker.close();
        }
        if let Some(mqtt) = &self.mqtt {
            mqtt.close();
        }
    }

    /// Local subscriptions held on the transport.
    pub fn subscription_count(&self) -> usize {
        match (&self.broker, &self.mqtt) {
            (Some(broker), _) => broker.stats().subscription_count,
            (None, Some(mqtt)) => mqtt.subscription_count(),
            (None, None) => 0,
        }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .merge(api::router());

    if state.config.gateway.enabled {
        app = app.route(&state.config.gateway.path, get(gateway::ws_handler));
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(
        AppState::start(config)
            .await
            .context("Failed to start bridge")?,
    );

    let reporter = {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                ticker.tick().await;
                metrics::record_bridge_stats(&state.bridge.stats());
            }
        })
    };

    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Tether server listening on {}", addr);
    if state.config.mqtt.enabled {
        info!(
            "Device fabric: mqtt://{}:{}",
            state.config.mqtt.host, state.config.mqtt.port
        );
    }
    if state.config.gateway.enabled {
        info!("Device gateway: ws://{}{}", addr, state.config.gateway.path);
    } else if !state.config.mqtt.enabled {
        warn!("Gateway disabled and no MQTT broker configured; devices cannot connect");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reporter.abort();
    state.shutdown();
    info!("Tether server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Service banner.
async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "message": "Tether device bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /health - Health check",
            "GET /api/devices - List all devices",
            "GET /api/devices/:id - Get one device",
            "POST /api/devices/register - Register a device over HTTP",
            "POST /api/devices/:id/heartbeat - Send a heartbeat over HTTP",
            "GET /api/devices/:id/status - Query device status",
            "POST /api/devices/:id/on - Turn device on",
            "POST /api/devices/:id/off - Turn device off",
            "POST /api/devices/:id/voice/enable - Enable voice control",
            "POST /api/devices/:id/voice/disable - Disable voice control",
            "POST /api/devices/:id/commands/:command - Send any command"
        ]
    }))
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.bridge.stats();
    metrics::record_bridge_stats(&stats);
    let status = if state.transport.is_healthy() {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "devices": {
            "total": stats.devices_total,
            "online": stats.devices_online,
        },
        "pendingRequests": stats.pending_requests,
        "transport": state.transport.name(),
        "subscriptions": state.subscription_count(),
    }))
}
