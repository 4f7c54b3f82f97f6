//! Subscription bookkeeping shared by the transports.
//!
//! Each subscription owns a bounded queue. Delivery is best-effort and
//! at-most-once: a subscriber whose queue is full misses the message.

use crate::traits::{Subscription, SubscriptionId, TransportMessage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_protocol::TopicFilter;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

struct SubscriberEntry {
    filter: TopicFilter,
    sender: mpsc::Sender<TransportMessage>,
}

/// Live subscriptions keyed by id.
pub(crate) struct SubscriberTable {
    entries: DashMap<SubscriptionId, SubscriberEntry>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl SubscriberTable {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a subscription and hand back its receiving side.
    pub(crate) fn insert(&self, filter: TopicFilter) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        self.entries.insert(
            id,
            SubscriberEntry {
                filter: filter.clone(),
                sender,
            },
        );
        debug!(subscription = %id, filter = %filter, "Subscribed");
        Subscription::new(id, filter, receiver)
    }

    /// Remove a subscription, returning the filter it was registered with.
    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<TopicFilter> {
        let (_, entry) = self.entries.remove(&id)?;
        debug!(subscription = %id, "Unsubscribed");
        Some(entry.filter)
    }

    /// Queue `message` for every matching subscriber and return how many
    /// accepted it. Subscribers whose receiver is gone are dropped.
    pub(crate) fn deliver(&self, message: &TransportMessage) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();

        for entry in self.entries.iter() {
            if !entry.filter.matches(&message.topic) {
                continue;
            }
            match entry.sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscription = %entry.key(),
                        topic = %message.topic,
                        "Subscriber queue full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => gone.push(*entry.key()),
            }
        }

        for id in gone {
            self.entries.remove(&id);
            debug!(subscription = %id, "Removed dropped subscription");
        }

        delivered
    }

    /// Drop subscriptions whose receivers have gone away.
    pub(crate) fn prune_closed(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.sender.is_closed());
        before - self.entries.len()
    }

    /// Distinct filters still in use.
    pub(crate) fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.filter.as_str().to_string())
            .collect();
        filters.sort_unstable();
        filters.dedup();
        filters
    }

    /// Whether any live subscription uses `filter`.
    pub(crate) fn has_filter(&self, filter: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.filter.as_str() == filter && !entry.sender.is_closed())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(text: &str) -> TopicFilter {
        TopicFilter::new(text).unwrap()
    }

    #[test]
    fn test_filters_are_deduplicated() {
        let table = SubscriberTable::new(4);
        let _a = table.insert(filter("devices/+/heartbeat"));
        let _b = table.insert(filter("devices/+/heartbeat"));
        let _c = table.insert(filter("devices/+/status"));

        assert_eq!(
            table.filters(),
            vec!["devices/+/heartbeat".to_string(), "devices/+/status".to_string()]
        );
        assert!(table.has_filter("devices/+/status"));
        assert!(!table.has_filter("devices/#"));
    }

    #[test]
    fn test_dropped_receiver_no_longer_holds_filter() {
        let table = SubscriberTable::new(4);
        let sub = table.insert(filter("devices/lamp-1/commands"));
        drop(sub);

        assert!(!table.has_filter("devices/lamp-1/commands"));
        assert_eq!(table.prune_closed(), 1);
        assert_eq!(table.len(), 0);
    }
}
