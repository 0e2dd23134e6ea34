use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::engine::events::ChannelInfo;
use crate::engine::validation::channel_from_name;
use crate::engine::{now_ms, paths};
use crate::error::{SessionResult, StoreError};
use crate::store::{EventSender, StoreConnection, Subscription, SubscriptionId};

/// Channel created when a server is first observed without any.
pub const DEFAULT_CHANNEL_ID: &str = "general";

#[derive(Debug, Deserialize)]
struct ChannelRecord {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    created: i64,
    /// Store-issued insertion stamp. Hand-written records may lack one.
    #[serde(default)]
    seq: String,
}

/// Write a channel record for `name` unless one with the same id exists.
/// Returns the channel id and whether this call created it.
pub fn create_channel(
    conn: &StoreConnection,
    server_id: &str,
    name: &str,
) -> SessionResult<(String, bool)> {
    let (id, display) = channel_from_name(name)?;
    let mut record = Map::new();
    record.insert("name".to_string(), json!(display));
    record.insert("created".to_string(), json!(now_ms()));
    let created = conn.create_if_absent_sequenced(&paths::channel(server_id, &id), record)?;
    if created {
        info!(%server_id, channel_id = %id, "channel created");
    } else {
        debug!(%server_id, channel_id = %id, "channel already exists");
    }
    Ok((id, created))
}

/// Live view of one server's channel directory.
pub struct ChannelRegistry {
    server_id: String,
    subscription: Subscription,
    /// Set after requesting the default channel, until a non-empty snapshot arrives.
    provisioning: bool,
    channels: Vec<ChannelInfo>,
}

impl ChannelRegistry {
    pub fn attach(
        conn: &StoreConnection,
        server_id: &str,
        tx: EventSender,
    ) -> Result<Self, StoreError> {
        let subscription = conn.subscribe_value(&paths::channels(server_id), tx)?;
        debug!(%server_id, subscription = %subscription.id(), "channel registry attached");
        Ok(Self {
            server_id: server_id.to_string(),
            subscription,
            provisioning: false,
            channels: Vec::new(),
        })
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    /// Last reported channel list.
    pub fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.channels.iter().any(|c| c.id == channel_id)
    }

    /// Process a directory snapshot.
    ///
    /// An empty directory triggers creation of the default channel and reports
    /// nothing; the creation echoes back as the next snapshot. A non-empty one
    /// is reported in insertion order.
    pub fn observe(
        &mut self,
        conn: &StoreConnection,
        snapshot: Option<&Value>,
    ) -> SessionResult<Option<Vec<ChannelInfo>>> {
        let Some(Value::Object(entries)) = snapshot else {
            self.channels.clear();
            if !self.provisioning {
                self.provisioning = true;
                create_channel(conn, &self.server_id, DEFAULT_CHANNEL_ID)?;
            }
            return Ok(None);
        };

        self.provisioning = false;
        let mut ordered: Vec<(String, ChannelInfo)> = entries
            .iter()
            .filter_map(|(id, raw)| {
                match serde_json::from_value::<ChannelRecord>(raw.clone()) {
                    Ok(record) => Some((
                        record.seq,
                        ChannelInfo {
                            id: id.clone(),
                            name: record.name.unwrap_or_else(|| id.clone()),
                            created: record.created,
                        },
                    )),
                    Err(e) => {
                        warn!(server_id = %self.server_id, channel_id = %id, "ignoring malformed channel: {e}");
                        None
                    }
                }
            })
            .collect();
        ordered.sort_by(|(a_seq, a), (b_seq, b)| {
            a_seq
                .cmp(b_seq)
                .then_with(|| a.created.cmp(&b.created))
                .then_with(|| a.id.cmp(&b.id))
        });
        let channels: Vec<ChannelInfo> = ordered.into_iter().map(|(_, info)| info).collect();

        self.channels = channels.clone();
        Ok(Some(channels))
    }

    /// Release the directory subscription.
    pub fn detach(self) {
        debug!(server_id = %self.server_id, "channel registry detached");
    }
}
