use serde::{Deserialize, Serialize};

/// One persisted leaf of the store tree.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeRow {
    pub path: String,
    /// JSON-encoded leaf value.
    pub value: String,
    pub updated_at: String,
}
