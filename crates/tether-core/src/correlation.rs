//! Request/response correlation.
//!
//! Every dispatched command gets a request id and an entry in the
//! [`CorrelationTable`]. Whoever removes the entry first (a matching
//! response, the deadline, a publish failure, or the sweeper) completes
//! the caller; everyone after that is a no-op.

use crate::error::BridgeError;
use crate::reply::CommandReply;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tether_protocol::envelope::now_millis;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Opaque request identifier.
pub type RequestId = String;

/// What a caller eventually receives.
pub type Outcome = Result<CommandReply, BridgeError>;

/// Atomic counter mixed into request ids.
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a collision-resistant request id: wall-clock millis, a process
/// counter and random bits.
#[must_use]
pub fn generate_request_id() -> RequestId {
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{:x}-{}", now_millis(), counter, &random[..8])
}

struct Slot {
    fulfilled: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
}

/// Single-fulfillment completion handle.
///
/// Clones share the same slot; only the first [`fulfill`](Self::fulfill)
/// across all clones delivers an outcome.
#[derive(Clone)]
pub struct Completion {
    slot: Arc<Slot>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("fulfilled", &self.is_fulfilled())
            .finish()
    }
}

/// Receiving side of a [`Completion`].
#[derive(Debug)]
pub struct CompletionWaiter {
    receiver: oneshot::Receiver<Outcome>,
}

/// Create a connected completion handle and waiter.
#[must_use]
pub fn completion() -> (Completion, CompletionWaiter) {
    let (sender, receiver) = oneshot::channel();
    let slot = Slot {
        fulfilled: AtomicBool::new(false),
        sender: Mutex::new(Some(sender)),
    };
    (
        Completion {
            slot: Arc::new(slot),
        },
        CompletionWaiter { receiver },
    )
}

impl Completion {
    /// Deliver `outcome` unless the slot was already fulfilled.
    ///
    /// Returns `true` if this call won.
    pub fn fulfill(&self, outcome: Outcome) -> bool {
        if self
            .slot
            .fulfilled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let sender = match self.slot.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(sender) = sender {
            // The waiter may be gone (caller cancelled); the slot is spent either way.
            let _ = sender.send(outcome);
        }
        true
    }

    /// Check whether an outcome has been delivered.
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.slot.fulfilled.load(Ordering::Acquire)
    }
}

impl CompletionWaiter {
    /// Wait for the outcome.
    ///
    /// Returns `None` if every completion handle was dropped unfulfilled.
    pub async fn recv(&mut self) -> Option<Outcome> {
        (&mut self.receiver).await.ok()
    }
}

/// An outstanding request.
#[derive(Debug)]
pub struct PendingRequest {
    /// Target device.
    pub device_id: String,
    /// Command name.
    pub command: String,
    /// When the request was registered.
    pub created_at: Instant,
    /// When the request times out.
    pub deadline: Instant,
    completion: Completion,
}

impl PendingRequest {
    /// Create a pending request registered now.
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        command: impl Into<String>,
        completion: Completion,
        deadline: Instant,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            command: command.into(),
            created_at: Instant::now(),
            deadline,
            completion,
        }
    }

    fn timeout_error(&self, request_id: &str) -> BridgeError {
        BridgeError::Timeout {
            request_id: request_id.to_string(),
            device: self.device_id.clone(),
            timeout_ms: u64::try_from(
                self.deadline
                    .saturating_duration_since(self.created_at)
                    .as_millis(),
            )
            .unwrap_or(u64::MAX),
        }
    }
}

/// Context of a pending request, as seen by response handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingContext {
    /// Target device.
    pub device_id: String,
    /// Command name.
    pub command: String,
}

/// Outstanding requests keyed by request id.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: DashMap<RequestId, PendingRequest>,
}

impl CorrelationTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DuplicateRequestId`] if the id is already
    /// outstanding. The existing entry is left untouched.
    pub fn register(
        &self,
        request_id: impl Into<RequestId>,
        request: PendingRequest,
    ) -> Result<(), BridgeError> {
        let request_id = request_id.into();
        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                error!(request_id = %request_id, "Duplicate request id");
                Err(BridgeError::DuplicateRequestId(request_id))
            }
            Entry::Vacant(entry) => {
                debug!(
                    request_id = %request_id,
                    device = %request.device_id,
                    command = %request.command,
                    "Request registered"
                );
                entry.insert(request);
                Ok(())
            }
        }
    }

    /// Complete a request with `outcome`.
    ///
    /// Returns `false` if the request is not outstanding (already
    /// completed, expired or never registered).
    pub fn complete(&self, request_id: &str, outcome: Outcome) -> bool {
        let Some((_, request)) = self.pending.remove(request_id) else {
            debug!(request_id = %request_id, "Completion for unknown request ignored");
            return false;
        };

        debug!(
            request_id = %request_id,
            device = %request.device_id,
            ok = outcome.is_ok(),
            "Request completed"
        );
        request.completion.fulfill(outcome)
    }

    /// Time out a request, building the error from its own entry.
    pub fn expire(&self, request_id: &str) -> bool {
        let Some((_, request)) = self.pending.remove(request_id) else {
            return false;
        };
        let err = request.timeout_error(request_id);
        warn!(request_id = %request_id, device = %request.device_id, "Request timed out");
        request.completion.fulfill(Err(err))
    }

    /// Time out every request whose deadline has passed at `now`.
    ///
    /// Returns the number of requests expired.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        expired.iter().filter(|id| self.expire(id)).count()
    }

    /// Look up the device and command of an outstanding request.
    #[must_use]
    pub fn context(&self, request_id: &str) -> Option<PendingContext> {
        self.pending.get(request_id).map(|entry| PendingContext {
            device_id: entry.device_id.clone(),
            command: entry.command.clone(),
        })
    }

    /// Check whether a request is outstanding.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
