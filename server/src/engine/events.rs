use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// A channel as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    /// Creation time, epoch milliseconds.
    pub created: i64,
}

/// A live presence entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub uid: String,
    pub username: String,
    pub ts: i64,
}

/// A delivered channel message. `key` is the push key and defines order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub key: String,
    pub username: String,
    pub text: String,
    pub ts: i64,
}

/// What a session reports to its observer.
/// The gateway serializes these verbatim onto the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Identity resolved; always the first event of a session.
    Ready {
        uid: String,
        username: String,
        saved_servers: Vec<String>,
    },

    ServerJoined {
        server_id: String,
    },

    /// Observers should clear everything rendered for this server.
    ServerLeft {
        server_id: String,
    },

    /// Full channel list of the active server, in creation order.
    ChannelsChanged {
        server_id: String,
        channels: Vec<ChannelInfo>,
        active_channel: Option<String>,
    },

    /// A new message feed begins; observers should clear the previous one.
    ChannelSwitched {
        server_id: String,
        channel_id: String,
    },

    MessageAppended {
        server_id: String,
        channel_id: String,
        message: MessageInfo,
    },

    /// Full set of users currently present on the active server.
    PresenceChanged {
        server_id: String,
        users: Vec<PresenceInfo>,
    },

    NameChanged {
        username: String,
    },

    Error {
        code: String,
        message: String,
    },
}

impl SessionEvent {
    pub fn error(err: &SessionError) -> Self {
        Self::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}
