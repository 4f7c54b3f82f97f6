//! The bridge facade.
//!
//! [`Bridge`] owns the presence store and correlation table, subscribes to
//! the inbound device topics on a [`Transport`], and runs the classifier and
//! both sweepers as background tasks.

use crate::classifier::{Classified, Classifier, DeviceEvent};
use crate::correlation::{CorrelationTable, Outcome};
use crate::dispatcher::Dispatcher;
use crate::presence::{Device, PresenceStore};
use crate::sweeper::{spawn_correlation_sweeper, spawn_presence_sweeper};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_protocol::{TopicFilter, TopicKind};
use tether_transport::{Subscription, Transport, TransportError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Topic segments the bridge listens on.
/// Voice triggers arrive on this alias of the events topic.
const AUDIO_SEGMENT: &str = "audio";

/// Filters for every device-to-bridge topic.
fn inbound_filters() -> Vec<TopicFilter> {
    [
        TopicKind::Heartbeat,
        TopicKind::Status,
        TopicKind::Responses,
        TopicKind::Events,
        TopicKind::Other(AUDIO_SEGMENT.to_string()),
    ]
    .iter()
    .map(TopicFilter::all_devices)
    .collect()
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Default wait for a command response.
    pub command_timeout: Duration,
    /// Silence after which a device counts as offline.
    pub staleness_threshold: Duration,
    /// How often the presence sweeper runs.
    pub presence_sweep_interval: Duration,
    /// How often the correlation sweeper runs.
    pub correlation_sweep_interval: Duration,
    /// Backlog per device event listener.
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            staleness_threshold: Duration::from_secs(60),
            presence_sweep_interval: Duration::from_secs(30),
            correlation_sweep_interval: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    heartbeats: AtomicU64,
    statuses: AtomicU64,
    responses: AtomicU64,
    late_responses: AtomicU64,
    events: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn record(&self, classified: &Classified) {
        let counter = match classified {
            Classified::Heartbeat => &self.heartbeats,
            Classified::Status { .. } => &self.statuses,
            Classified::Response { completed: true } => &self.responses,
            Classified::Response { completed: false } => &self.late_responses,
            Classified::Event => &self.events,
            Classified::Discarded(_) => &self.discarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bridge statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Known devices.
    pub devices_total: usize,
    /// Devices currently online.
    pub devices_online: usize,
    /// Outstanding command requests.
    pub pending_requests: usize,
    /// Heartbeats applied.
    pub heartbeats: u64,
    /// Status reports received.
    pub statuses: u64,
    /// Responses that completed a caller.
    pub responses: u64,
    /// Responses that arrived too late or for someone else.
    pub late_responses: u64,
    /// Device events surfaced.
    pub events: u64,
    /// Inbound messages dropped.
    pub discarded: u64,
}

/// Connects synchronous callers to asynchronous devices.
pub struct Bridge {
    presence: Arc<PresenceStore>,
    table: Arc<CorrelationTable>,
    classifier: Arc<Classifier>,
    dispatcher: Dispatcher,
    counters: Arc<Counters>,
    config: BridgeConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Subscribe to the inbound device topics and start background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses a subscription.
    pub async fn start(
        transport: Arc<dyn Transport>,
        config: BridgeConfig,
    ) -> Result<Self, TransportError> {
        info!("Starting bridge on {} transport with config: {:?}", transport.name(), config);

        let presence = Arc::new(PresenceStore::new());
        let table = Arc::new(CorrelationTable::new());
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&presence),
            Arc::clone(&table),
            config.event_capacity,
        ));
        let counters = Arc::new(Counters::default());

        let filters = inbound_filters();
        let mut tasks = Vec::with_capacity(filters.len() + 2);
        for filter in &filters {
            let subscription = match transport.subscribe(filter.as_str()).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    tasks.iter().for_each(JoinHandle::abort);
                    return Err(e);
                }
            };
            debug!(filter = %subscription.filter(), id = %subscription.id(), "Subscribed");
            tasks.push(spawn_listener(
                subscription,
                Arc::clone(&classifier),
                Arc::clone(&counters),
            ));
        }

        tasks.push(spawn_presence_sweeper(
            Arc::clone(&presence),
            config.presence_sweep_interval,
            config.staleness_threshold,
        ));
        tasks.push(spawn_correlation_sweeper(
            Arc::clone(&table),
            config.correlation_sweep_interval,
        ));

        let dispatcher = Dispatcher::new(
            Arc::clone(&presence),
            Arc::clone(&table),
            transport,
            config.staleness_threshold,
        );

        Ok(Self {
            presence,
            table,
            classifier,
            dispatcher,
            counters,
            config,
            tasks: Mutex::new(tasks),
        })
    }

    /// All known devices, in registration order.
    #[must_use]
    pub fn list_devices(&self) -> Vec<Device> {
        self.presence.list()
    }

    /// One device, if it has ever sent a heartbeat.
    #[must_use]
    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.presence.get(device_id)
    }

    /// Send a command and wait for the device's answer.
    ///
    /// See [`Dispatcher::dispatch`] for the possible errors.
    pub async fn dispatch(&self, device_id: &str, command: &str, timeout: Duration) -> Outcome {
        self.dispatcher.dispatch(device_id, command, timeout).await
    }

    /// Like [`dispatch`](Self::dispatch) with the configured default timeout.
    pub async fn dispatch_default(&self, device_id: &str, command: &str) -> Outcome {
        self.dispatch(device_id, command, self.config.command_timeout)
            .await
    }

    /// Listen for out-of-band device events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.classifier.subscribe_events()
    }

    /// The presence store.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    /// The correlation table.
    #[must_use]
    pub fn correlation(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    /// The configuration the bridge was started with.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Get bridge statistics.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        let presence = self.presence.stats();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        BridgeStats {
            devices_total: presence.total,
            devices_online: presence.online,
            pending_requests: self.table.len(),
            heartbeats: load(&self.counters.heartbeats),
            statuses: load(&self.counters.statuses),
            responses: load(&self.counters.responses),
            late_responses: load(&self.counters.late_responses),
            events: load(&self.counters.events),
            discarded: load(&self.counters.discarded),
        }
    }

    /// Stop listening and sweeping. Outstanding dispatches still resolve by
    /// their own deadlines.
    pub fn shutdown(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if !tasks.is_empty() {
            info!(tasks = tasks.len(), "Bridge shutting down");
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_listener(
    mut subscription: Subscription,
    classifier: Arc<Classifier>,
    counters: Arc<Counters>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = subscription.recv().await {
            let classified = classifier.on_message(&message.topic, &message.payload);
            counters.record(&classified);
        }
        warn!(filter = %subscription.filter(), "Inbound subscription closed");
    })
}
