use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::engine::session::SessionSettings;
use crate::error::ConfigError;

/// Top-level configuration, loaded from campfire.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CampfireConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub messages: MessagesSection,
    pub presence: PresenceSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub web_address: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            web_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// SQLite URL backing the store. Required.
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:campfire.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MessagesSection {
    /// Trailing window delivered to a new channel subscriber.
    pub window_size: usize,
    pub max_message_length: usize,
}

impl Default for MessagesSection {
    fn default() -> Self {
        Self {
            window_size: 200,
            max_message_length: 2000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PresenceSection {
    pub heartbeat_secs: u64,
    /// Entries whose timestamp is older than this are treated as gone.
    pub ttl_secs: u64,
    pub sweep_secs: u64,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: 10,
            ttl_secs: 30,
            sweep_secs: 15,
        }
    }
}

impl CampfireConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            Self::from_toml(path, &contents)?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_toml(path: &str, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("WEB_ADDRESS") {
            self.server.web_address = v;
        }
        if let Some(v) = var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = var("MESSAGE_WINDOW")
            && let Ok(n) = v.parse()
        {
            self.messages.window_size = n;
        }
        if let Some(v) = var("MAX_MESSAGE_LENGTH")
            && let Ok(len) = v.parse()
        {
            self.messages.max_message_length = len;
        }
        if let Some(v) = var("PRESENCE_HEARTBEAT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.presence.heartbeat_secs = secs;
        }
        if let Some(v) = var("PRESENCE_TTL_SECS")
            && let Ok(secs) = v.parse()
        {
            self.presence.ttl_secs = secs;
        }
        if let Some(v) = var("PRESENCE_SWEEP_SECS")
            && let Ok(secs) = v.parse()
        {
            self.presence.sweep_secs = secs;
        }
    }

    /// Reject configurations the hub cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.web_address.trim().is_empty() {
            return Err(ConfigError::Missing("server.web_address"));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Missing("database.url"));
        }
        if self.messages.window_size == 0 {
            return Err(ConfigError::Invalid {
                field: "messages.window_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.messages.max_message_length == 0 {
            return Err(ConfigError::Invalid {
                field: "messages.max_message_length",
                reason: "must be at least 1".into(),
            });
        }
        if self.presence.heartbeat_secs == 0 || self.presence.sweep_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "presence",
                reason: "heartbeat and sweep intervals must be non-zero".into(),
            });
        }
        if self.presence.heartbeat_secs >= self.presence.ttl_secs {
            return Err(ConfigError::Invalid {
                field: "presence.ttl_secs",
                reason: format!(
                    "ttl ({}s) must exceed the heartbeat interval ({}s)",
                    self.presence.ttl_secs, self.presence.heartbeat_secs
                ),
            });
        }
        Ok(())
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.presence.sweep_secs)
    }

    /// Per-session tunables handed to every [`crate::engine::session::SessionManager`].
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            window_size: self.messages.window_size,
            max_message_length: self.messages.max_message_length,
            heartbeat_interval: Duration::from_secs(self.presence.heartbeat_secs),
            presence_ttl: self.presence_ttl(),
        }
    }
}
