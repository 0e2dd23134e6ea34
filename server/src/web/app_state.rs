use std::sync::Arc;

use crate::engine::session::SessionSettings;
use crate::store::MemoryStore;

/// Shared application state accessible from all axum handlers.
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub settings: SessionSettings,
}
