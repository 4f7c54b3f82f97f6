//! Periodic background sweeps.
//!
//! The presence sweeper demotes devices whose heartbeats went stale. The
//! correlation sweeper is a safety net for requests whose callers went away
//! before their own deadline fired; it completes through the same
//! single-fulfillment path, so racing with a response is harmless.

use crate::correlation::CorrelationTable;
use crate::presence::PresenceStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Spawn the presence sweeper.
///
/// Every `period`, devices silent for longer than `threshold` are marked
/// offline. The first sweep runs one `period` after spawning.
pub fn spawn_presence_sweeper(
    store: Arc<PresenceStore>,
    period: Duration,
    threshold: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let demoted = store.sweep_stale(Instant::now(), threshold);
            if demoted > 0 {
                debug!(demoted, "Presence sweep");
            }
        }
    })
}

/// Spawn the correlation sweeper, expiring overdue requests every `period`.
pub fn spawn_correlation_sweeper(table: Arc<CorrelationTable>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = table.sweep_expired(Instant::now());
            if expired > 0 {
                debug!(expired, "Correlation sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{completion, PendingRequest};
    use crate::error::BridgeError;
    use tether_protocol::HeartbeatPayload;

    #[tokio::test(start_paused = true)]
    async fn test_presence_sweeper_demotes_silent_devices() {
        let store = Arc::new(PresenceStore::new());
        store.upsert("lamp-1", &HeartbeatPayload::default()).unwrap();

        let sweeper = spawn_presence_sweeper(
            Arc::clone(&store),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.get("lamp-1").unwrap().online);

        // Next tick at 90s.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!store.get("lamp-1").unwrap().online);

        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_correlation_sweeper_reclaims_orphans() {
        let table = Arc::new(CorrelationTable::new());
        let (handle, mut waiter) = completion();
        table
            .register(
                "r1",
                PendingRequest::new("lamp-1", "turn_on", handle, Instant::now() + Duration::from_secs(10)),
            )
            .unwrap();

        let sweeper = spawn_correlation_sweeper(Arc::clone(&table), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(table.is_empty());
        assert!(matches!(
            waiter.recv().await,
            Some(Err(BridgeError::Timeout { .. }))
        ));
        sweeper.abort();
    }
}
