use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;

use super::memory::MemoryStore;
use super::{ConnectionId, EventSender, SubscriptionId};

/// One client's link to the shared store.
///
/// Every operation fails with [`StoreError::Disconnected`] once the
/// connection is closed. Closing (explicitly or by dropping) runs the
/// connection's disconnect hooks and releases its listeners.
pub struct StoreConnection {
    id: ConnectionId,
    store: Arc<MemoryStore>,
    closed: AtomicBool,
}

impl StoreConnection {
    pub fn open(store: Arc<MemoryStore>) -> Self {
        let id = Uuid::new_v4();
        store.register_connection(id);
        Self {
            id,
            store,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }

    pub fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_open()?;
        self.store.get(path)
    }

    pub fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.set(path, value)
    }

    pub fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.update(path, fields)
    }

    pub fn create_if_absent(&self, path: &str, value: Value) -> Result<bool, StoreError> {
        self.ensure_open()?;
        self.store.create_if_absent(path, value)
    }

    pub fn create_if_absent_sequenced(
        &self,
        path: &str,
        record: Map<String, Value>,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        self.store.create_if_absent_sequenced(path, record)
    }

    pub fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.remove(path)
    }

    pub fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        self.ensure_open()?;
        self.store.push(path, value)
    }

    pub fn subscribe_value(&self, path: &str, tx: EventSender) -> Result<Subscription, StoreError> {
        self.ensure_open()?;
        let id = self.store.subscribe_value(self.id, path, tx)?;
        Ok(Subscription::new(id, self.store.clone()))
    }

    pub fn subscribe_child_added(
        &self,
        path: &str,
        limit: usize,
        tx: EventSender,
    ) -> Result<Subscription, StoreError> {
        self.ensure_open()?;
        let id = self.store.subscribe_child_added(self.id, path, limit, tx)?;
        Ok(Subscription::new(id, self.store.clone()))
    }

    /// Remove `path` automatically when this connection closes.
    pub fn on_disconnect_remove(&self, path: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.arm_disconnect_hook(self.id, path)
    }

    pub fn cancel_on_disconnect(&self, path: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.disarm_disconnect_hook(self.id, path)
    }

    /// Close the connection. Idempotent.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let fired = self.store.close_connection(self.id);
        info!(connection = %self.id, hooks = fired, "store connection closed");
    }
}

impl Drop for StoreConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConnection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// A live listener. Dropping it stops delivery.
pub struct Subscription {
    id: SubscriptionId,
    store: Arc<MemoryStore>,
}

impl Subscription {
    fn new(id: SubscriptionId, store: Arc<MemoryStore>) -> Self {
        Self { id, store }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.unsubscribe(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subscription").field(&self.id).finish()
    }
}
