//! Store locations used by the session layer.

/// Root of the ephemeral presence subtree.
pub const PRESENCE_ROOT: &str = "presence";

pub fn server(server_id: &str) -> String {
    format!("servers/{server_id}")
}

pub fn channels(server_id: &str) -> String {
    format!("servers/{server_id}/channels")
}

pub fn channel(server_id: &str, channel_id: &str) -> String {
    format!("servers/{server_id}/channels/{channel_id}")
}

pub fn messages(server_id: &str, channel_id: &str) -> String {
    format!("messages/{server_id}/{channel_id}")
}

pub fn presence(server_id: &str) -> String {
    format!("{PRESENCE_ROOT}/{server_id}")
}

pub fn presence_entry(server_id: &str, uid: &str) -> String {
    format!("{PRESENCE_ROOT}/{server_id}/{uid}")
}
