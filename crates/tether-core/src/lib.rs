//! # tether-core
//!
//! Device presence tracking and command correlation for Tether.
//!
//! Devices speak an asynchronous publish/subscribe protocol; callers want a
//! synchronous answer. This crate sits in between:
//!
//! - **PresenceStore** - latest known state of every device, liveness from heartbeats
//! - **CorrelationTable** - outstanding requests and their single-fulfillment completions
//! - **Dispatcher** - publish a command, wait for its response or the deadline
//! - **Classifier** - route inbound device messages to the right place
//! - **Bridge** - wires all of the above to a [`Transport`](tether_transport::Transport)
//!
//! ## Architecture
//!
//! ```text
//!                  dispatch()                       devices/{id}/commands
//! ┌──────────┐   ┌────────────┐   publish   ┌─────────────┐
//! │  Caller  │──▶│ Dispatcher │────────────▶│  Transport  │──▶ device
//! └──────────┘   └────────────┘             └─────────────┘
//!       ▲              │ register                  │ heartbeat/status/
//!       │              ▼                           │ responses/events
//!       │        ┌─────────────┐  complete  ┌─────────────┐
//!       └────────│ Correlation │◀───────────│ Classifier  │
//!                │    Table    │            └─────────────┘
//!                └─────────────┘                   │ upsert
//!                       ▲                          ▼
//!                 ┌───────────┐             ┌─────────────┐
//!                 │  Sweepers │────────────▶│  Presence   │
//!                 └───────────┘             └─────────────┘
//! ```
//!
//! Every dispatch resolves exactly once: with the device's reply, or with a
//! [`BridgeError`] telling the caller whether the device is unknown, offline,
//! unreachable, silent or reported a failure.

pub mod bridge;
pub mod classifier;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod presence;
pub mod reply;
pub mod sweeper;

pub use bridge::{Bridge, BridgeConfig, BridgeStats};
pub use classifier::{Classified, Classifier, DeviceEvent, DiscardReason};
pub use correlation::{
    completion, generate_request_id, Completion, CompletionWaiter, CorrelationTable, Outcome,
    PendingRequest, RequestId,
};
pub use dispatcher::{Dispatcher, MAX_COMMAND_TIMEOUT};
pub use error::BridgeError;
pub use presence::{Device, PresenceChange, PresenceStats, PresenceStore};
pub use reply::{CommandReply, DeviceState};
