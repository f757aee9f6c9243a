//! SQLite persistence for pending operations, protocol state and local mirrors.
//!
//! This module is split into:
//! - `mod.rs` - Store struct, connection pool, placeholder identity rewrite
//! - `schema.rs` - Database schema initialization
//! - `pending.rs` - Pending operation CRUD and state transitions
//! - `protocol_state.rs` - Per-account protocol cursor with optimistic commit
//! - `folder.rs` - Local folder hierarchy mirror
//! - `item.rs` - Local items, fetched attachments and directory search results

mod folder;
mod item;
mod pending;
mod protocol_state;
mod schema;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::pending::AccountId;

pub use folder::LocalFolder;
pub use item::{DirectoryEntry, LocalItem};
pub use pending::DeferRelease;
pub use protocol_state::StaleProtocolState;

/// Connection pool size. Each account controller holds at most one connection
/// at a time; the rest serve the engine API and the binary.
const POOL_SIZE: u32 = 8;

/// Every column that may hold a server id, in rewrite order.
const REWRITE_STATEMENTS: &[&str] = &[
    "UPDATE folders SET server_id = ?, awaiting_create = 0 WHERE account_id = ? AND server_id = ?",
    "UPDATE folders SET parent_id = ? WHERE account_id = ? AND parent_id = ?",
    "UPDATE items SET server_id = ?, awaiting_create = 0 WHERE account_id = ? AND server_id = ?",
    "UPDATE items SET parent_id = ? WHERE account_id = ? AND parent_id = ?",
    "UPDATE pending SET server_id = ? WHERE account_id = ? AND server_id = ?",
    "UPDATE pending SET parent_id = ? WHERE account_id = ? AND parent_id = ?",
    "UPDATE pending SET dest_parent_id = ? WHERE account_id = ? AND dest_parent_id = ?",
];

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .context("Failed to create connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    //
    // Identity Rewrite
    //

    /// Replace a server id everywhere it is referenced: local folders, local items
    /// and pending operations. Runs in one transaction; either every reference
    /// moves to `to` or none does. Returns the number of rows touched.
    pub async fn rewrite_server_id(&self, account_id: AccountId, from: &str, to: &str) -> Result<u64> {
        self.rewrite_server_id_with(account_id, from, to, None, |_| Ok(()))
            .await
    }

    /// Rewrite a created folder's placeholder to its server id and record the
    /// parent and name the server created it with, in one transaction.
    pub async fn confirm_folder(
        &self,
        account_id: AccountId,
        placeholder: &str,
        server_id: &str,
        parent_id: &str,
        display_name: &str,
    ) -> Result<u64> {
        self.rewrite_server_id_with(
            account_id,
            placeholder,
            server_id,
            Some((parent_id, display_name)),
            |_| Ok(()),
        )
        .await
    }

    /// As `rewrite_server_id`, calling `checkpoint` before each statement.
    /// An error from the checkpoint abandons the transaction. `folder` is the
    /// confirmed (parent, name) of the folder now known as `to`.
    pub(crate) async fn rewrite_server_id_with<F>(
        &self,
        account_id: AccountId,
        from: &str,
        to: &str,
        folder: Option<(&str, &str)>,
        mut checkpoint: F,
    ) -> Result<u64>
    where
        F: FnMut(usize) -> Result<()>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin identity rewrite")?;

        let mut touched = 0;
        for (step, statement) in REWRITE_STATEMENTS.iter().enumerate() {
            checkpoint(step)?;
            touched += sqlx::query(statement)
                .bind(to)
                .bind(account_id)
                .bind(from)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Identity rewrite step {} failed", step))?
                .rows_affected();
        }

        if let Some((parent_id, display_name)) = folder {
            sqlx::query(
                "UPDATE folders SET parent_id = ?, display_name = ? WHERE account_id = ? AND server_id = ?",
            )
            .bind(parent_id)
            .bind(display_name)
            .bind(account_id)
            .bind(to)
            .execute(&mut *tx)
            .await
            .context("Failed to record confirmed folder")?;
        }

        tx.commit()
            .await
            .context("Failed to commit identity rewrite")?;

        tracing::debug!(
            "Rewrote server id {} -> {} for account {} ({} rows)",
            from,
            to,
            account_id,
            touched
        );
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{Operation, PendingOperation};

    async fn seed_placeholder_references(store: &Store, placeholder: &str) {
        store
            .insert_folder(&LocalFolder::awaiting_create(1, placeholder, "0", "Projects", 12))
            .await
            .unwrap();
        store
            .insert_folder(&LocalFolder::new(1, "ph-child", placeholder, "Child", 12))
            .await
            .unwrap();
        store
            .insert_item(&LocalItem::new(1, "item-1", placeholder, "Email"))
            .await
            .unwrap();

        let mut create = PendingOperation::new(1, Operation::FolderCreate)
            .with_server_id(placeholder)
            .with_parent("0")
            .with_display_name("Projects");
        store.insert_pending(&mut create).await.unwrap();

        let mut move_in = PendingOperation::new(1, Operation::EmailMove)
            .with_server_id("item-2")
            .with_parent("5")
            .with_dest_parent(placeholder);
        store.insert_pending(&mut move_in).await.unwrap();
    }

    async fn count_references(store: &Store, id: &str) -> i64 {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            SELECT
              (SELECT COUNT(*) FROM folders WHERE server_id = ?1 OR parent_id = ?1) +
              (SELECT COUNT(*) FROM items WHERE server_id = ?1 OR parent_id = ?1) +
              (SELECT COUNT(*) FROM pending
                 WHERE server_id = ?1 OR parent_id = ?1 OR dest_parent_id = ?1) AS refs
            "#,
        )
        .bind(id)
        .fetch_one(&store.pool)
        .await
        .unwrap();
        row.get("refs")
    }

    #[tokio::test]
    async fn test_rewrite_updates_every_reference() {
        let store = Store::open_in_memory().await.unwrap();
        seed_placeholder_references(&store, "ph:abc").await;
        assert_eq!(count_references(&store, "ph:abc").await, 5);

        store.rewrite_server_id(1, "ph:abc", "42").await.unwrap();

        assert_eq!(count_references(&store, "ph:abc").await, 0);
        assert_eq!(count_references(&store, "42").await, 5);
        let folder = store.folder(1, "42").await.unwrap().unwrap();
        assert!(!folder.awaiting_create);
    }

    #[tokio::test]
    async fn test_rewrite_aborted_midway_leaves_no_mix() {
        let store = Store::open_in_memory().await.unwrap();
        seed_placeholder_references(&store, "ph:abc").await;

        for fail_at in 1..REWRITE_STATEMENTS.len() {
            let result = store
                .rewrite_server_id_with(1, "ph:abc", "42", None, |step| {
                    if step == fail_at {
                        anyhow::bail!("simulated crash at step {}", step);
                    }
                    Ok(())
                })
                .await;

            assert!(result.is_err());
            assert_eq!(count_references(&store, "ph:abc").await, 5);
            assert_eq!(count_references(&store, "42").await, 0);
        }
    }

    #[tokio::test]
    async fn test_rewrite_is_scoped_to_account() {
        let store = Store::open_in_memory().await.unwrap();
        seed_placeholder_references(&store, "ph:abc").await;
        store
            .insert_item(&LocalItem::new(2, "ph:abc", "7", "Calendar"))
            .await
            .unwrap();

        store.rewrite_server_id(1, "ph:abc", "42").await.unwrap();

        assert!(store.item(2, "ph:abc").await.unwrap().is_some());
    }
}
