use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::engine::events::MessageInfo;
use crate::engine::validation::validate_message;
use crate::engine::{now_ms, paths};
use crate::error::{SessionResult, StoreError};
use crate::store::{EventSender, StoreConnection, Subscription, SubscriptionId};

/// Number of trailing messages delivered when a channel is opened.
pub const DEFAULT_WINDOW_SIZE: usize = 200;

#[derive(Debug, Deserialize)]
struct MessageRecord {
    #[serde(default)]
    username: String,
    text: String,
    #[serde(default)]
    ts: i64,
}

/// Append a message to a channel. Returns its push key.
pub fn publish(
    conn: &StoreConnection,
    server_id: &str,
    channel_id: &str,
    author: &str,
    body: &str,
    max_len: usize,
) -> SessionResult<String> {
    let text = validate_message(body, max_len)?;
    let key = conn.push(
        &paths::messages(server_id, channel_id),
        json!({ "username": author, "text": text, "ts": now_ms() }),
    )?;
    debug!(%server_id, %channel_id, %key, "message published");
    Ok(key)
}

/// Ordered feed of one channel's messages.
pub struct MessageStream {
    server_id: String,
    channel_id: String,
    subscription: Subscription,
}

impl MessageStream {
    /// Start delivery with the last `window_size` messages, oldest first.
    pub fn subscribe(
        conn: &StoreConnection,
        server_id: &str,
        channel_id: &str,
        window_size: usize,
        tx: EventSender,
    ) -> Result<Self, StoreError> {
        let subscription =
            conn.subscribe_child_added(&paths::messages(server_id, channel_id), window_size, tx)?;
        debug!(%server_id, %channel_id, window_size, "message stream subscribed");
        Ok(Self {
            server_id: server_id.to_string(),
            channel_id: channel_id.to_string(),
            subscription,
        })
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    /// Decode one delivered child. Malformed entries are skipped.
    pub fn observe(&self, key: &str, value: &Value) -> Option<MessageInfo> {
        match serde_json::from_value::<MessageRecord>(value.clone()) {
            Ok(record) => Some(MessageInfo {
                key: key.to_string(),
                username: record.username,
                text: record.text,
                ts: record.ts,
            }),
            Err(e) => {
                warn!(channel_id = %self.channel_id, %key, "ignoring malformed message: {e}");
                None
            }
        }
    }

    pub fn unsubscribe(self) {
        debug!(server_id = %self.server_id, channel_id = %self.channel_id, "message stream released");
    }
}
