use crate::error::ValidationError;
use crate::store::path::FORBIDDEN_KEY_CHARS;

/// Default maximum message body length (characters).
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Maximum channel display name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 50;

/// Maximum server id length.
pub const MAX_SERVER_ID_LENGTH: usize = 64;

/// Maximum display name length.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 32;

/// First character that cannot appear in a store key.
fn forbidden_char(s: &str) -> Option<char> {
    s.chars()
        .find(|&c| c == '/' || FORBIDDEN_KEY_CHARS.contains(&c) || c.is_control())
}

/// Channel id for a display name: trimmed, whitespace runs collapsed to `-`, lowercased.
pub fn normalize_channel_id(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

/// Validate a channel name and derive `(id, display name)` from it.
pub fn channel_from_name(name: &str) -> Result<(String, String), ValidationError> {
    let display = name.trim();
    if display.is_empty() {
        return Err(ValidationError::EmptyChannelName);
    }
    if display.chars().count() > MAX_CHANNEL_NAME_LENGTH {
        return Err(ValidationError::TooLong {
            what: "Channel name",
            max: MAX_CHANNEL_NAME_LENGTH,
        });
    }
    let id = normalize_channel_id(display);
    if let Some(ch) = forbidden_char(&id) {
        return Err(ValidationError::ForbiddenCharacter {
            what: "Channel name",
            ch,
        });
    }
    Ok((id, display.to_string()))
}

/// Validate a server id. Returns it trimmed.
pub fn validate_server_id(server_id: &str) -> Result<String, ValidationError> {
    let id = server_id.trim();
    if id.is_empty() {
        return Err(ValidationError::EmptyServerId);
    }
    if id.chars().count() > MAX_SERVER_ID_LENGTH {
        return Err(ValidationError::TooLong {
            what: "Server id",
            max: MAX_SERVER_ID_LENGTH,
        });
    }
    if let Some(ch) = forbidden_char(id) {
        return Err(ValidationError::ForbiddenCharacter {
            what: "Server id",
            ch,
        });
    }
    Ok(id.to_string())
}

/// Validate a message body against `max_len`. Returns the trimmed body.
pub fn validate_message(body: &str, max_len: usize) -> Result<String, ValidationError> {
    let text = body.trim();
    if text.is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    if text.chars().count() > max_len {
        return Err(ValidationError::TooLong {
            what: "Message",
            max: max_len,
        });
    }
    Ok(text.to_string())
}

/// Validate a display name. Returns it trimmed.
pub fn validate_display_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyDisplayName);
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(ValidationError::TooLong {
            what: "Display name",
            max: MAX_DISPLAY_NAME_LENGTH,
        });
    }
    if let Some(ch) = name.chars().find(|c| c.is_control()) {
        return Err(ValidationError::ForbiddenCharacter {
            what: "Display name",
            ch,
        });
    }
    Ok(name.to_string())
}
