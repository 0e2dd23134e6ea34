//! Write-behind mirroring of the store tree into SQLite.
//!
//! Writes are queued in order and applied by a single task, so the database
//! always converges to the in-memory tree. Ephemeral roots are never stored.

use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::db::queries::nodes;
use crate::error::StoreError;

use super::path::StorePath;
use super::tree;

/// Top-level keys that live only in memory.
pub const EPHEMERAL_ROOTS: &[&str] = &["presence"];

fn is_ephemeral(path: &StorePath) -> bool {
    path.top_level()
        .is_some_and(|root| EPHEMERAL_ROOTS.contains(&root))
}

enum PersistOp {
    Replace {
        path: StorePath,
        leaves: Vec<(String, String)>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the background writer.
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistenceHandle {
    /// Start the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(pool: SqlitePool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(pool, rx));
        Self { tx }
    }

    /// Queue a replacement of everything at `path` with `value`.
    pub fn replace(&self, path: &StorePath, value: Option<&Value>) {
        if is_ephemeral(path) {
            return;
        }

        let mut flat = Vec::new();
        if let Some(value) = value {
            tree::flatten(path, value, &mut flat);
        }
        let leaves = flat
            .into_iter()
            .filter(|(leaf, _)| !is_ephemeral(leaf))
            .map(|(leaf, value)| (leaf.to_string(), value.to_string()))
            .collect();

        let op = PersistOp::Replace {
            path: path.clone(),
            leaves,
        };
        if self.tx.send(op).is_err() {
            warn!(%path, "persistence writer stopped, write not mirrored");
        }
    }

    /// Resolve once every previously queued write has been applied.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(PersistOp::Flush(done_tx))
            .map_err(|_| StoreError::Closed)?;
        done_rx.await.map_err(|_| StoreError::Closed)
    }
}

async fn run_writer(pool: SqlitePool, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::Replace { path, leaves } => {
                let ancestors: Vec<String> =
                    path.ancestors().iter().map(ToString::to_string).collect();
                let key = path.to_string();
                if let Err(e) = nodes::replace_subtree(&pool, &key, &ancestors, &leaves).await {
                    error!(path = %key, "failed to persist write: {e}");
                }
            }
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("persistence writer exiting");
}

/// Rebuild the tree from stored leaves. Rows that fail to parse are skipped.
pub async fn load_tree(pool: &SqlitePool) -> Result<Value, StoreError> {
    let rows = nodes::load_nodes(pool).await?;
    let mut root = Value::Null;

    for row in rows {
        let path = match StorePath::parse(&row.path) {
            Ok(path) if !is_ephemeral(&path) => path,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %row.path, "skipping stored node: {e}");
                continue;
            }
        };
        match serde_json::from_str::<Value>(&row.value) {
            Ok(value) => tree::write(&mut root, path.segments(), value),
            Err(e) => warn!(%path, "skipping stored node with bad value: {e}"),
        }
    }
    Ok(root)
}
