//! Local folder hierarchy mirror.

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::Store;
use crate::constants::INITIAL_SYNC_KEY;
use crate::pending::AccountId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFolder {
    pub account_id: AccountId,
    pub server_id: String,
    pub parent_id: String,
    pub display_name: String,
    pub folder_type: u32,
    pub sync_key: String,
    /// Created locally; `server_id` is a placeholder until the server confirms.
    pub awaiting_create: bool,
}

impl LocalFolder {
    pub fn new(
        account_id: AccountId,
        server_id: &str,
        parent_id: &str,
        display_name: &str,
        folder_type: u32,
    ) -> Self {
        Self {
            account_id,
            server_id: server_id.to_string(),
            parent_id: parent_id.to_string(),
            display_name: display_name.to_string(),
            folder_type,
            sync_key: INITIAL_SYNC_KEY.to_string(),
            awaiting_create: false,
        }
    }

    pub fn awaiting_create(
        account_id: AccountId,
        placeholder: &str,
        parent_id: &str,
        display_name: &str,
        folder_type: u32,
    ) -> Self {
        Self {
            awaiting_create: true,
            ..Self::new(account_id, placeholder, parent_id, display_name, folder_type)
        }
    }

    fn from_row(row: &SqliteRow) -> Self {
        Self {
            account_id: row.get("account_id"),
            server_id: row.get("server_id"),
            parent_id: row.get("parent_id"),
            display_name: row.get("display_name"),
            folder_type: row.get::<i64, _>("folder_type") as u32,
            sync_key: row.get("sync_key"),
            awaiting_create: row.get::<i64, _>("awaiting_create") != 0,
        }
    }
}

impl Store {
    //
    // Folder Operations
    //

    pub async fn insert_folder(&self, folder: &LocalFolder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO folders
                (account_id, server_id, parent_id, display_name, folder_type, sync_key, awaiting_create)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(folder.account_id)
        .bind(&folder.server_id)
        .bind(&folder.parent_id)
        .bind(&folder.display_name)
        .bind(i64::from(folder.folder_type))
        .bind(&folder.sync_key)
        .bind(folder.awaiting_create as i64)
        .execute(&self.pool)
        .await
        .context("Failed to insert folder")?;

        Ok(())
    }

    pub async fn folder(&self, account_id: AccountId, server_id: &str) -> Result<Option<LocalFolder>> {
        let row = sqlx::query("SELECT * FROM folders WHERE account_id = ? AND server_id = ?")
            .bind(account_id)
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(LocalFolder::from_row))
    }

    /// Server-confirmed folders of an account, in server id order.
    pub async fn folders(&self, account_id: AccountId) -> Result<Vec<LocalFolder>> {
        let rows = sqlx::query(
            "SELECT * FROM folders WHERE account_id = ? AND awaiting_create = 0 ORDER BY server_id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(LocalFolder::from_row).collect())
    }

    /// Apply a confirmed rename and/or reparent.
    pub async fn update_folder(
        &self,
        account_id: AccountId,
        server_id: &str,
        parent_id: &str,
        display_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE folders SET parent_id = ?, display_name = ? WHERE account_id = ? AND server_id = ?",
        )
        .bind(parent_id)
        .bind(display_name)
        .bind(account_id)
        .bind(server_id)
        .execute(&self.pool)
        .await
        .context("Failed to update folder")?;

        Ok(())
    }

    /// Delete a folder along with the items it holds.
    pub async fn delete_folder(&self, account_id: AccountId, server_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM items WHERE account_id = ? AND parent_id = ?")
            .bind(account_id)
            .bind(server_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM folders WHERE account_id = ? AND server_id = ?")
            .bind(account_id)
            .bind(server_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("Failed to delete folder")?;
        Ok(())
    }

    pub async fn set_folder_sync_key(
        &self,
        account_id: AccountId,
        server_id: &str,
        sync_key: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE folders SET sync_key = ? WHERE account_id = ? AND server_id = ?")
            .bind(sync_key)
            .bind(account_id)
            .bind(server_id)
            .execute(&self.pool)
            .await
            .context("Failed to set folder sync key")?;

        Ok(())
    }
}
