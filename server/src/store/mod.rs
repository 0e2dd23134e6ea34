//! Realtime JSON tree store.
//!
//! [`MemoryStore`] is the shared tree. Clients talk to it through a
//! [`StoreConnection`], which owns the client's disconnect hooks and hands out
//! [`Subscription`] handles. Notifications are pushed into a caller-supplied
//! [`EventSender`], tagged with the subscription that produced them.

pub mod connection;
pub mod memory;
pub mod path;
pub mod persistence;
pub mod push_id;
pub mod tree;

use std::fmt;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use connection::{StoreConnection, Subscription};
pub use memory::MemoryStore;
pub use path::StorePath;

/// Identifies one client connection to the store.
pub type ConnectionId = Uuid;

/// Identifies one live listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A notification produced by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub subscription: SubscriptionId,
    pub kind: StoreEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEventKind {
    /// Full value at the subscribed path (`None` when absent).
    Value(Option<Value>),
    /// A child appeared under the subscribed path.
    ChildAdded { key: String, value: Value },
}

pub type EventSender = mpsc::UnboundedSender<StoreEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<StoreEvent>;
