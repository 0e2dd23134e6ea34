//! Presence entries: who is currently on a server.
//!
//! An entry disappears when its owner leaves, when the owner's store
//! connection closes (disconnect hook), or once its timestamp is older than
//! the TTL. Live owners keep their timestamp fresh with a heartbeat.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::engine::events::PresenceInfo;
use crate::engine::{now_ms, paths};
use crate::error::StoreError;
use crate::store::{EventSender, MemoryStore, StoreConnection, Subscription, SubscriptionId};

#[derive(Debug, Deserialize)]
struct PresenceRecord {
    username: String,
    ts: i64,
}

fn presence_record(username: &str) -> Value {
    json!({ "username": username, "ts": now_ms() })
}

fn cutoff(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_sub(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Entries without a readable timestamp count as expired.
fn is_expired(entry: &Value, cutoff: i64) -> bool {
    entry
        .get("ts")
        .and_then(Value::as_i64)
        .is_none_or(|ts| ts < cutoff)
}

/// Name currently announced, shared with the heartbeat. `None` once renounced.
///
/// Every write of the entry happens while this lock is held, so a heartbeat
/// can never land after a renounce or carry a name that has been replaced.
type Announcement = Arc<Mutex<Option<String>>>;

fn lock_announcement(slot: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Presence of the current user on one server, plus a view of everyone else's.
pub struct PresenceTracker {
    server_id: String,
    uid: String,
    ttl: Duration,
    subscription: Subscription,
    announcement: Announcement,
    heartbeat: Option<JoinHandle<()>>,
}

impl PresenceTracker {
    pub fn subscribe(
        conn: &StoreConnection,
        server_id: &str,
        uid: &str,
        ttl: Duration,
        tx: EventSender,
    ) -> Result<Self, StoreError> {
        let subscription = conn.subscribe_value(&paths::presence(server_id), tx)?;
        debug!(%server_id, subscription = %subscription.id(), "presence subscribed");
        Ok(Self {
            server_id: server_id.to_string(),
            uid: uid.to_string(),
            ttl,
            subscription,
            announcement: Arc::new(Mutex::new(None)),
            heartbeat: None,
        })
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    fn entry_path(&self) -> String {
        paths::presence_entry(&self.server_id, &self.uid)
    }

    /// Publish (or overwrite) this user's entry and tie it to the connection.
    pub fn announce(
        &mut self,
        conn: &Arc<StoreConnection>,
        display_name: &str,
        heartbeat: Duration,
    ) -> Result<(), StoreError> {
        let path = self.entry_path();
        {
            let mut announced = lock_announcement(&self.announcement);
            conn.set(&path, presence_record(display_name))?;
            conn.on_disconnect_remove(&path)?;
            *announced = Some(display_name.to_string());
        }

        if self.heartbeat.as_ref().is_none_or(JoinHandle::is_finished) {
            self.heartbeat = spawn_heartbeat(
                Arc::downgrade(conn),
                path,
                self.announcement.clone(),
                heartbeat,
            );
        }
        info!(server_id = %self.server_id, uid = %self.uid, "presence announced");
        Ok(())
    }

    /// Remove this user's entry and disarm its disconnect hook.
    pub fn renounce(&mut self, conn: &StoreConnection) -> Result<(), StoreError> {
        self.stop_heartbeat();
        if lock_announcement(&self.announcement).take().is_none() {
            return Ok(());
        }
        let path = self.entry_path();
        conn.cancel_on_disconnect(&path)?;
        conn.remove(&path)?;
        info!(server_id = %self.server_id, uid = %self.uid, "presence renounced");
        Ok(())
    }

    /// Live users in a presence snapshot, ordered by name. Expired entries are left out.
    pub fn observe(&self, snapshot: Option<&Value>) -> Vec<PresenceInfo> {
        let Some(Value::Object(entries)) = snapshot else {
            return Vec::new();
        };
        let cutoff = cutoff(now_ms(), self.ttl);

        let mut users: Vec<PresenceInfo> = entries
            .iter()
            .filter(|(_, entry)| !is_expired(entry, cutoff))
            .filter_map(|(uid, entry)| {
                serde_json::from_value::<PresenceRecord>(entry.clone())
                    .ok()
                    .map(|record| PresenceInfo {
                        uid: uid.clone(),
                        username: record.username,
                        ts: record.ts,
                    })
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.uid.cmp(&b.uid)));
        users
    }

    /// Release the presence subscription. Does not touch the entry itself.
    pub fn unsubscribe(mut self) {
        self.stop_heartbeat();
        lock_announcement(&self.announcement).take();
        debug!(server_id = %self.server_id, "presence unsubscribed");
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.stop_heartbeat();
        lock_announcement(&self.announcement).take();
    }
}

/// Rewrite the entry with a fresh timestamp every `every` while it is
/// announced and the connection is alive. An entry removed by the sweeper is
/// written back. Returns `None` outside a Tokio runtime.
fn spawn_heartbeat(
    conn: Weak<StoreConnection>,
    path: String,
    announcement: Announcement,
    every: Duration,
) -> Option<JoinHandle<()>> {
    let runtime = Handle::try_current().ok()?;

    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(conn) = conn.upgrade() else { break };
            let announced = lock_announcement(&announcement);
            let Some(username) = announced.as_deref() else {
                debug!(%path, "presence renounced, stopping heartbeat");
                break;
            };
            match conn.set(&path, presence_record(username)) {
                Ok(()) => trace!(%path, "presence heartbeat"),
                Err(e) => {
                    debug!(%path, "presence heartbeat stopped: {e}");
                    break;
                }
            }
        }
    }))
}

/// Remove every presence entry older than `ttl`. Returns how many were removed.
pub fn sweep_expired_presence(
    store: &MemoryStore,
    ttl: Duration,
    now_ms: i64,
) -> Result<usize, StoreError> {
    let Some(Value::Object(servers)) = store.get(paths::PRESENCE_ROOT)? else {
        return Ok(0);
    };
    let cutoff = cutoff(now_ms, ttl);

    let mut removed = 0;
    for (server_id, entries) in &servers {
        let Value::Object(entries) = entries else {
            continue;
        };
        for (uid, entry) in entries {
            if !is_expired(entry, cutoff) {
                continue;
            }
            // Re-checked under the store lock in case a heartbeat landed meanwhile
            let path = paths::presence_entry(server_id, uid);
            if store.remove_if(&path, |current| is_expired(current, cutoff))? {
                debug!(%server_id, %uid, "expired presence removed");
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Run [`sweep_expired_presence`] every `interval` until `cancel` fires.
pub fn spawn_presence_sweeper(
    store: Arc<MemoryStore>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("presence sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match sweep_expired_presence(&store, ttl, now_ms()) {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "swept expired presence"),
                        Err(e) => warn!("presence sweep failed: {e}"),
                    }
                }
            }
        }
    })
}
