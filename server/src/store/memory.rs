use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::{debug, info, trace};

use crate::error::StoreError;

use super::path::{self, StorePath};
use super::persistence::{self, PersistenceHandle};
use super::push_id::{PushIdGenerator, SEQUENCE_FIELD};
use super::tree;
use super::{ConnectionId, EventSender, StoreEvent, StoreEventKind, SubscriptionId};

/// The shared tree plus everything listening to it.
///
/// All mutations and notifications happen under one lock, so listeners on a
/// path observe changes in exactly the order they were applied.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Open connections and the paths each one removes when it goes away.
    connections: DashMap<ConnectionId, BTreeSet<StorePath>>,
    /// Write-behind mirror into SQLite, when configured.
    persistence: Option<PersistenceHandle>,
}

struct Inner {
    root: Value,
    listeners: BTreeMap<SubscriptionId, Listener>,
    next_subscription: u64,
    push_ids: PushIdGenerator,
}

struct Listener {
    owner: ConnectionId,
    path: StorePath,
    tx: EventSender,
    kind: ListenerKind,
}

enum ListenerKind {
    Value {
        last: Option<Value>,
    },
    ChildAdded {
        limit: usize,
        /// Highest key delivered so far. Keys at or below it are never sent again.
        watermark: Option<String>,
    },
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty, purely in-memory store.
    pub fn new() -> Self {
        Self::with_tree(Value::Null, None)
    }

    /// Rebuild the tree from the database and mirror every later write back into it.
    pub async fn open(pool: SqlitePool) -> Result<Self, StoreError> {
        let root = persistence::load_tree(&pool).await?;
        let handle = PersistenceHandle::spawn(pool);
        info!("store loaded from database");
        Ok(Self::with_tree(root, Some(handle)))
    }

    fn with_tree(root: Value, persistence: Option<PersistenceHandle>) -> Self {
        let push_ids = PushIdGenerator::seeded_from(&root);
        Self {
            inner: Mutex::new(Inner {
                root,
                listeners: BTreeMap::new(),
                next_subscription: 1,
                push_ids,
            }),
            connections: DashMap::new(),
            persistence,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Reads and writes ────────────────────────────────────────────

    pub fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let path = StorePath::parse(path)?;
        Ok(tree::get(&self.lock().root, path.segments()).cloned())
    }

    /// Replace the value at `path`. Null removes it.
    pub fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let path = StorePath::parse(path)?;
        let mut inner = self.lock();
        self.apply(&mut inner, vec![(path, value)]);
        Ok(())
    }

    /// Merge `fields` into the object at `path`, leaving other children alone.
    pub fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let base = StorePath::parse(path)?;
        let mut writes = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            if !path::is_valid_key(&key) {
                return Err(StoreError::InvalidPath(format!("{base}/{key}")));
            }
            writes.push((base.child(&key), value));
        }
        let mut inner = self.lock();
        self.apply(&mut inner, writes);
        Ok(())
    }

    /// Write `value` only if nothing exists at `path`. Returns whether it wrote.
    pub fn create_if_absent(&self, path: &str, value: Value) -> Result<bool, StoreError> {
        let path = StorePath::parse(path)?;
        let mut inner = self.lock();
        if tree::get(&inner.root, path.segments()).is_some() {
            return Ok(false);
        }
        self.apply(&mut inner, vec![(path, value)]);
        Ok(true)
    }

    /// Like [`create_if_absent`](Self::create_if_absent), but stamps the new
    /// record's `seq` field with a push id issued under the store lock, so
    /// sibling records created this way sort in insertion order.
    pub fn create_if_absent_sequenced(
        &self,
        path: &str,
        mut record: Map<String, Value>,
    ) -> Result<bool, StoreError> {
        let path = StorePath::parse(path)?;
        let mut inner = self.lock();
        if tree::get(&inner.root, path.segments()).is_some() {
            return Ok(false);
        }
        let stamp = inner.push_ids.next_id(Utc::now().timestamp_millis());
        record.insert(SEQUENCE_FIELD.to_string(), Value::String(stamp));
        self.apply(&mut inner, vec![(path, Value::Object(record))]);
        Ok(true)
    }

    pub fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.set(path, Value::Null)
    }

    /// Remove the value at `path` if `predicate` holds for it, atomically.
    pub fn remove_if(
        &self,
        path: &str,
        predicate: impl FnOnce(&Value) -> bool,
    ) -> Result<bool, StoreError> {
        let path = StorePath::parse(path)?;
        let mut inner = self.lock();
        match tree::get(&inner.root, path.segments()) {
            Some(current) if predicate(current) => {}
            _ => return Ok(false),
        }
        self.apply(&mut inner, vec![(path, Value::Null)]);
        Ok(true)
    }

    /// Append `value` under a fresh push key and return the key.
    pub fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let base = StorePath::parse(path)?;
        let mut inner = self.lock();
        let key = inner.push_ids.next_id(Utc::now().timestamp_millis());
        self.apply(&mut inner, vec![(base.child(&key), value)]);
        Ok(key)
    }

    fn apply(&self, inner: &mut Inner, writes: Vec<(StorePath, Value)>) {
        let changed: Vec<StorePath> = writes.iter().map(|(path, _)| path.clone()).collect();
        for (path, value) in writes {
            tree::write(&mut inner.root, path.segments(), value);
        }
        if let Some(persistence) = &self.persistence {
            for path in &changed {
                persistence.replace(path, tree::get(&inner.root, path.segments()));
            }
        }
        inner.notify(&changed);
    }

    // ── Listeners ───────────────────────────────────────────────────

    /// Register a listener that receives the full value at `path` now and on every change.
    pub(crate) fn subscribe_value(
        &self,
        owner: ConnectionId,
        path: &str,
        tx: EventSender,
    ) -> Result<SubscriptionId, StoreError> {
        let path = StorePath::parse(path)?;
        let mut inner = self.lock();
        let id = inner.allocate_id();
        let current = tree::get(&inner.root, path.segments()).cloned();

        // A closed receiver is pruned on the next notification.
        let _ = tx.send(StoreEvent {
            subscription: id,
            kind: StoreEventKind::Value(current.clone()),
        });

        trace!(%id, %path, "value listener registered");
        inner.listeners.insert(
            id,
            Listener {
                owner,
                path,
                tx,
                kind: ListenerKind::Value { last: current },
            },
        );
        Ok(id)
    }

    /// Register a listener that receives the last `limit` children of `path`
    /// (oldest first) and then every child appended after them.
    pub(crate) fn subscribe_child_added(
        &self,
        owner: ConnectionId,
        path: &str,
        limit: usize,
        tx: EventSender,
    ) -> Result<SubscriptionId, StoreError> {
        let path = StorePath::parse(path)?;
        let mut inner = self.lock();
        let id = inner.allocate_id();

        let mut listener = Listener {
            owner,
            path,
            tx,
            kind: ListenerKind::ChildAdded {
                limit: limit.max(1),
                watermark: None,
            },
        };
        listener.deliver(id, &inner.root);

        trace!(%id, path = %listener.path, limit, "child listener registered");
        inner.listeners.insert(id, listener);
        Ok(id)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.lock().listeners.remove(&id).is_some();
        if removed {
            trace!(%id, "listener released");
        }
        removed
    }

    // ── Connections and disconnect hooks ────────────────────────────

    pub(crate) fn register_connection(&self, id: ConnectionId) {
        self.connections.insert(id, BTreeSet::new());
    }

    pub(crate) fn arm_disconnect_hook(
        &self,
        owner: ConnectionId,
        path: &str,
    ) -> Result<(), StoreError> {
        let path = StorePath::parse(path)?;
        let mut hooks = self
            .connections
            .get_mut(&owner)
            .ok_or(StoreError::Disconnected)?;
        hooks.insert(path);
        Ok(())
    }

    pub(crate) fn disarm_disconnect_hook(
        &self,
        owner: ConnectionId,
        path: &str,
    ) -> Result<(), StoreError> {
        let path = StorePath::parse(path)?;
        let mut hooks = self
            .connections
            .get_mut(&owner)
            .ok_or(StoreError::Disconnected)?;
        hooks.remove(&path);
        Ok(())
    }

    /// Drop the connection's listeners and run its disconnect hooks.
    /// Returns the number of hooks that fired.
    pub(crate) fn close_connection(&self, owner: ConnectionId) -> usize {
        let hooks = self
            .connections
            .remove(&owner)
            .map(|(_, hooks)| hooks)
            .unwrap_or_default();

        let mut inner = self.lock();
        inner.listeners.retain(|_, listener| listener.owner != owner);

        let fired = hooks.len();
        if fired > 0 {
            let removals = hooks.into_iter().map(|path| (path, Value::Null)).collect();
            self.apply(&mut inner, removals);
        }
        debug!(connection = %owner, fired, "connection closed");
        fired
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Number of listeners registered exactly at `path`.
    pub fn listeners_on(&self, path: &str) -> usize {
        let Ok(path) = StorePath::parse(path) else {
            return 0;
        };
        self.lock()
            .listeners
            .values()
            .filter(|listener| listener.path == path)
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Wait until every write issued so far has reached the database.
    pub async fn flush(&self) -> Result<(), StoreError> {
        match &self.persistence {
            Some(persistence) => persistence.flush().await,
            None => Ok(()),
        }
    }
}

impl Inner {
    fn allocate_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        id
    }

    /// Notify every listener whose path overlaps a changed path.
    /// Listeners whose receiver has gone away are dropped.
    fn notify(&mut self, changed: &[StorePath]) {
        let root = &self.root;
        self.listeners.retain(|id, listener| {
            if !changed.iter().any(|path| path.overlaps(&listener.path)) {
                return true;
            }
            listener.deliver(*id, root)
        });
    }
}

impl Listener {
    /// Send whatever this listener has not seen yet. Returns false if the receiver is gone.
    fn deliver(&mut self, id: SubscriptionId, root: &Value) -> bool {
        let current = tree::get(root, self.path.segments());
        match &mut self.kind {
            ListenerKind::Value { last } => {
                if last.as_ref() == current {
                    return true;
                }
                *last = current.cloned();
                self.tx
                    .send(StoreEvent {
                        subscription: id,
                        kind: StoreEventKind::Value(last.clone()),
                    })
                    .is_ok()
            }
            ListenerKind::ChildAdded { limit, watermark } => {
                let Some(Value::Object(children)) = current else {
                    return true;
                };
                let mut fresh: Vec<(&String, &Value)> = children
                    .iter()
                    .filter(|(key, _)| {
                        watermark
                            .as_deref()
                            .is_none_or(|mark| key.as_str() > mark)
                    })
                    .collect();
                fresh.sort_by(|a, b| a.0.cmp(b.0));

                let skip = fresh.len().saturating_sub(*limit);
                for (key, value) in fresh.into_iter().skip(skip) {
                    *watermark = Some(key.clone());
                    let event = StoreEvent {
                        subscription: id,
                        kind: StoreEventKind::ChildAdded {
                            key: key.clone(),
                            value: value.clone(),
                        },
                    };
                    if self.tx.send(event).is_err() {
                        return false;
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::store::EventReceiver;

    fn listener_channel() -> (EventSender, EventReceiver) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut EventReceiver) -> Vec<StoreEventKind> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.kind);
        }
        out
    }

    fn child_keys(events: &[StoreEventKind]) -> Vec<String> {
        events
            .iter()
            .filter_map(|kind| match kind {
                StoreEventKind::ChildAdded { key, .. } => Some(key.clone()),
                StoreEventKind::Value(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_set_get_remove() {
        let store = MemoryStore::new();
        store.set("servers/a/created", json!(1)).unwrap();
        assert_eq!(store.get("servers/a").unwrap(), Some(json!({"created": 1})));

        store.remove("servers/a/created").unwrap();
        assert_eq!(store.get("servers/a").unwrap(), None);
        assert_eq!(store.get("servers").unwrap(), None);
    }

    #[test]
    fn test_update_merges_fields() {
        let store = MemoryStore::new();
        store
            .set("servers/a/channels/general", json!({"name": "general", "created": 5}))
            .unwrap();

        let mut fields = Map::new();
        fields.insert("created".into(), json!(9));
        store.update("servers/a", fields).unwrap();

        assert_eq!(
            store.get("servers/a").unwrap(),
            Some(json!({"created": 9, "channels": {"general": {"name": "general", "created": 5}}}))
        );
    }

    #[test]
    fn test_update_rejects_bad_keys() {
        let store = MemoryStore::new();
        let mut fields = Map::new();
        fields.insert("a.b".into(), json!(1));
        assert!(matches!(
            store.update("servers/a", fields),
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_create_if_absent_writes_once() {
        let store = MemoryStore::new();
        assert!(store.create_if_absent("c/general", json!({"created": 1})).unwrap());
        assert!(!store.create_if_absent("c/general", json!({"created": 2})).unwrap());
        assert_eq!(store.get("c/general").unwrap(), Some(json!({"created": 1})));
    }

    #[test]
    fn test_value_listener_initial_and_changes() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let (tx, mut rx) = listener_channel();
        store.subscribe_value(owner, "servers/a/channels", tx).unwrap();

        store.set("servers/a/channels/general", json!({"name": "general"})).unwrap();
        // Unrelated path: no event
        store.set("servers/b/channels/x", json!({"name": "x"})).unwrap();
        // Ancestor write that leaves the value unchanged: no event
        store.set("servers/a/created", json!(1)).unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                StoreEventKind::Value(None),
                StoreEventKind::Value(Some(json!({"general": {"name": "general"}}))),
            ]
        );
    }

    #[test]
    fn test_push_keys_are_ordered() {
        let store = MemoryStore::new();
        let a = store.push("messages/s/c", json!({"text": "a"})).unwrap();
        let b = store.push("messages/s/c", json!({"text": "b"})).unwrap();
        let c = store.push("messages/s/c", json!({"text": "c"})).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_push_after_reload_sorts_after_stored_keys() {
        // Stored history stamped an hour ahead of this process's clock
        let ahead = u64::try_from(Utc::now().timestamp_millis()).unwrap() + 3_600_000;
        let stored = format!("{ahead:012x}{:08x}", 0);
        let mut channel = Map::new();
        channel.insert(stored.clone(), json!({"text": "old"}));
        let root = json!({"messages": {"s": {"c": channel}}});

        let store = MemoryStore::with_tree(root, None);
        let key = store.push("messages/s/c", json!({"text": "new"})).unwrap();
        assert!(key > stored, "{key} should sort after {stored}");
    }

    #[test]
    fn test_sequenced_create_stamps_insertion_order() {
        let store = MemoryStore::new();
        let mut zeta = Map::new();
        zeta.insert("name".into(), json!("zeta"));
        let mut alpha = Map::new();
        alpha.insert("name".into(), json!("alpha"));

        assert!(store.create_if_absent_sequenced("c/zeta", zeta.clone()).unwrap());
        assert!(store.create_if_absent_sequenced("c/alpha", alpha).unwrap());
        assert!(!store.create_if_absent_sequenced("c/zeta", zeta).unwrap());

        let first = store.get("c/zeta/seq").unwrap().unwrap();
        let second = store.get("c/alpha/seq").unwrap().unwrap();
        assert!(first.as_str().unwrap() < second.as_str().unwrap());
        assert_eq!(store.get("c/zeta/name").unwrap(), Some(json!("zeta")));
    }

    #[test]
    fn test_child_added_backfills_window_then_streams() {
        let store = MemoryStore::new();
        let keys: Vec<String> = (0..5)
            .map(|i| store.push("messages/s/c", json!({"text": i})).unwrap())
            .collect();

        let (tx, mut rx) = listener_channel();
        store
            .subscribe_child_added(Uuid::new_v4(), "messages/s/c", 3, tx)
            .unwrap();
        assert_eq!(child_keys(&drain(&mut rx)), keys[2..].to_vec());

        let next = store.push("messages/s/c", json!({"text": 5})).unwrap();
        // A write elsewhere in the channel's subtree does not redeliver old keys
        store.set("messages/s/other/x", json!(1)).unwrap();
        assert_eq!(child_keys(&drain(&mut rx)), vec![next]);
    }

    #[test]
    fn test_child_added_on_empty_path() {
        let store = MemoryStore::new();
        let (tx, mut rx) = listener_channel();
        store
            .subscribe_child_added(Uuid::new_v4(), "messages/s/c", 10, tx)
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        let key = store.push("messages/s/c", json!({"text": "first"})).unwrap();
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![StoreEventKind::ChildAdded {
                key,
                value: json!({"text": "first"})
            }]
        );
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = MemoryStore::new();
        let (tx, mut rx) = listener_channel();
        let id = store.subscribe_value(Uuid::new_v4(), "a", tx).unwrap();
        drain(&mut rx);

        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set("a/b", json!(1)).unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_closed_receiver_is_pruned() {
        let store = MemoryStore::new();
        let (tx, rx) = listener_channel();
        store.subscribe_value(Uuid::new_v4(), "a", tx).unwrap();
        drop(rx);

        store.set("a", json!(1)).unwrap();
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_close_connection_runs_hooks_and_drops_listeners() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let observer = Uuid::new_v4();
        store.register_connection(owner);
        store.register_connection(observer);

        store.set("presence/s/u1", json!({"username": "alice"})).unwrap();
        store.arm_disconnect_hook(owner, "presence/s/u1").unwrap();

        let (own_tx, _own_rx) = listener_channel();
        store.subscribe_value(owner, "presence/s", own_tx).unwrap();
        let (tx, mut rx) = listener_channel();
        store.subscribe_value(observer, "presence/s", tx).unwrap();
        drain(&mut rx);

        assert_eq!(store.close_connection(owner), 1);
        assert_eq!(store.get("presence/s/u1").unwrap(), None);
        assert_eq!(drain(&mut rx), vec![StoreEventKind::Value(None)]);
        assert_eq!(store.listener_count(), 1);
        assert_eq!(store.connection_count(), 1);
    }

    #[test]
    fn test_disarmed_hook_does_not_fire() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        store.register_connection(owner);
        store.set("presence/s/u1", json!({"username": "alice"})).unwrap();
        store.arm_disconnect_hook(owner, "presence/s/u1").unwrap();
        store.disarm_disconnect_hook(owner, "presence/s/u1").unwrap();

        assert_eq!(store.close_connection(owner), 0);
        assert!(store.get("presence/s/u1").unwrap().is_some());
    }

    #[test]
    fn test_hooks_require_open_connection() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.arm_disconnect_hook(Uuid::new_v4(), "presence/s/u"),
            Err(StoreError::Disconnected)
        ));
    }

    #[test]
    fn test_conditional_writes() {
        let store = MemoryStore::new();
        assert!(!store.remove_if("p/u", |_| true).unwrap());

        store.set("p/u", json!({"ts": 2})).unwrap();
        assert!(!store.remove_if("p/u", |v| v["ts"] == json!(1)).unwrap());
        assert!(store.remove_if("p/u", |v| v["ts"] == json!(2)).unwrap());
        assert_eq!(store.get("p/u").unwrap(), None);
    }
}
