//! Session, presence and channel lifecycle on top of the realtime store.

pub mod channels;
pub mod events;
pub mod identity;
pub mod messages;
pub mod paths;
pub mod presence;
pub mod session;
pub mod validation;

use chrono::Utc;

/// Current wall-clock time as epoch milliseconds, the timestamp format stored in the tree.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
