use sqlx::SqlitePool;

use crate::db::models::NodeRow;

/// Every persisted leaf, ordered by path.
pub async fn load_nodes(pool: &SqlitePool) -> Result<Vec<NodeRow>, sqlx::Error> {
    sqlx::query_as::<_, NodeRow>("SELECT path, value, updated_at FROM nodes ORDER BY path")
        .fetch_all(pool)
        .await
}

const DELETE_EXACT: &str = "DELETE FROM nodes WHERE path = ?";

/// Half-open range over every path strictly below a prefix. `'0'` is the byte
/// after `'/'`, so the bounds stay on the primary key index.
const DELETE_DESCENDANTS: &str = "DELETE FROM nodes WHERE path >= ? AND path < ?";

/// Replace everything stored at or below `path` with `leaves`.
///
/// `ancestors` are the strict ancestors of `path`; any leaf row stored at one
/// of them is shadowed by the new subtree and is deleted. An empty `path`
/// means the whole tree.
pub async fn replace_subtree(
    pool: &SqlitePool,
    path: &str,
    ancestors: &[String],
    leaves: &[(String, String)],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    if path.is_empty() {
        sqlx::query("DELETE FROM nodes").execute(&mut *tx).await?;
    } else {
        sqlx::query(DELETE_EXACT)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        sqlx::query(DELETE_DESCENDANTS)
            .bind(format!("{path}/"))
            .bind(format!("{path}0"))
            .execute(&mut *tx)
            .await?;
    }

    for ancestor in ancestors {
        sqlx::query(DELETE_EXACT)
            .bind(ancestor)
            .execute(&mut *tx)
            .await?;
    }

    for (leaf, value) in leaves {
        sqlx::query(
            "INSERT INTO nodes (path, value, updated_at) VALUES (?, ?, datetime('now')) \
             ON CONFLICT(path) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
        )
        .bind(leaf)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}
