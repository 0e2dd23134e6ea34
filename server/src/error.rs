//! Error hierarchy for Campfire.
//!
//! Each layer has its own error type; [`SessionError`] is what the session
//! contracts return and what the gateway turns into client-visible `error` events.

use thiserror::Error;

// ============================================================================
// Configuration
// ============================================================================

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ============================================================================
// Store
// ============================================================================

/// Failures reported by the realtime store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection is closed")]
    Disconnected,

    #[error("invalid store path: {0}")]
    InvalidPath(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("persistence writer has stopped")]
    Closed,
}

// ============================================================================
// Session preconditions and validation
// ============================================================================

/// An operation was invoked without the session state it needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("no active server")]
    NoActiveServer,

    #[error("no active channel")]
    NoActiveChannel,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Input rejected before anything was written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("server id cannot be empty")]
    EmptyServerId,

    #[error("channel name cannot be empty")]
    EmptyChannelName,

    #[error("message cannot be empty")]
    EmptyMessage,

    #[error("display name cannot be empty")]
    EmptyDisplayName,

    #[error("{what} too long (max {max} characters)")]
    TooLong { what: &'static str, max: usize },

    #[error("{what} contains a forbidden character: {ch:?}")]
    ForbiddenCharacter { what: &'static str, ch: char },
}

// ============================================================================
// Local profile
// ============================================================================

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("profile format error: {0}")]
    Format(#[from] serde_json::Error),
}

// ============================================================================
// Session
// ============================================================================

/// Everything a session operation can fail with.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl SessionError {
    /// Stable error code sent to clients.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Precondition(PreconditionError::NoActiveServer) => "no_active_server",
            Self::Precondition(PreconditionError::NoActiveChannel) => "no_active_channel",
            Self::Precondition(PreconditionError::UnknownChannel(_)) => "unknown_channel",
            Self::Validation(_) => "validation_error",
            Self::Store(_) => "store_error",
            Self::Profile(_) => "profile_error",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
