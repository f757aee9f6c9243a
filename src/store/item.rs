//! Local items, fetched attachments and directory search results.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::Store;
use crate::pending::AccountId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalItem {
    pub account_id: AccountId,
    pub server_id: String,
    pub parent_id: String,
    /// Item class: Email, Calendar, Contacts or Tasks.
    pub class: String,
    pub payload: Option<String>,
    pub awaiting_create: bool,
}

impl LocalItem {
    pub fn new(account_id: AccountId, server_id: &str, parent_id: &str, class: &str) -> Self {
        Self {
            account_id,
            server_id: server_id.to_string(),
            parent_id: parent_id.to_string(),
            class: class.to_string(),
            payload: None,
            awaiting_create: false,
        }
    }

    fn from_row(row: &SqliteRow) -> Self {
        Self {
            account_id: row.get("account_id"),
            server_id: row.get("server_id"),
            parent_id: row.get("parent_id"),
            class: row.get("class"),
            payload: row.get("payload"),
            awaiting_create: row.get::<i64, _>("awaiting_create") != 0,
        }
    }
}

/// One directory (GAL) search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub email: String,
    pub display_name: Option<String>,
    pub phone: Option<String>,
}

impl Store {
    //
    // Item Operations
    //

    pub async fn insert_item(&self, item: &LocalItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO items
                (account_id, server_id, parent_id, class, payload, awaiting_create)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.account_id)
        .bind(&item.server_id)
        .bind(&item.parent_id)
        .bind(&item.class)
        .bind(&item.payload)
        .bind(item.awaiting_create as i64)
        .execute(&self.pool)
        .await
        .context("Failed to insert item")?;

        Ok(())
    }

    pub async fn item(&self, account_id: AccountId, server_id: &str) -> Result<Option<LocalItem>> {
        let row = sqlx::query("SELECT * FROM items WHERE account_id = ? AND server_id = ?")
            .bind(account_id)
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(LocalItem::from_row))
    }

    /// Record that an item now lives in `dest_parent`.
    pub async fn move_item(&self, account_id: AccountId, server_id: &str, dest_parent: &str) -> Result<()> {
        sqlx::query("UPDATE items SET parent_id = ? WHERE account_id = ? AND server_id = ?")
            .bind(dest_parent)
            .bind(account_id)
            .bind(server_id)
            .execute(&self.pool)
            .await
            .context("Failed to move item")?;

        Ok(())
    }

    //
    // Attachment Operations
    //

    pub async fn save_attachment(
        &self,
        account_id: AccountId,
        file_reference: &str,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO attachments (account_id, file_reference, content_type, data, fetched_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(account_id)
        .bind(file_reference)
        .bind(content_type)
        .bind(data)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to save attachment")?;

        Ok(())
    }

    pub async fn attachment(&self, account_id: AccountId, file_reference: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT data FROM attachments WHERE account_id = ? AND file_reference = ?",
        )
        .bind(account_id)
        .bind(file_reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("data")))
    }

    //
    // Directory Search Operations
    //

    /// Replace the stored results of one directory search.
    pub async fn save_directory_results(
        &self,
        account_id: AccountId,
        search_token: &str,
        entries: &[DirectoryEntry],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM directory_results WHERE account_id = ? AND search_token = ?")
            .bind(account_id)
            .bind(search_token)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO directory_results
                    (account_id, search_token, email, display_name, phone)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(account_id)
            .bind(search_token)
            .bind(&entry.email)
            .bind(&entry.display_name)
            .bind(&entry.phone)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .context("Failed to save directory results")?;
        Ok(())
    }

    pub async fn directory_results(
        &self,
        account_id: AccountId,
        search_token: &str,
    ) -> Result<Vec<DirectoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT email, display_name, phone FROM directory_results
            WHERE account_id = ? AND search_token = ? ORDER BY email
            "#,
        )
        .bind(account_id)
        .bind(search_token)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DirectoryEntry {
                email: row.get("email"),
                display_name: row.get("display_name"),
                phone: row.get("phone"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_item() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_item(&LocalItem::new(1, "5:1", "5", "Email"))
            .await
            .unwrap();

        store.move_item(1, "5:1", "9").await.unwrap();

        assert_eq!(store.item(1, "5:1").await.unwrap().unwrap().parent_id, "9");
    }

    #[tokio::test]
    async fn test_attachment_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .save_attachment(1, "5:1:0", Some("text/plain"), b"hello")
            .await
            .unwrap();

        assert_eq!(store.attachment(1, "5:1:0").await.unwrap().as_deref(), Some(&b"hello"[..]));
        assert!(store.attachment(2, "5:1:0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_results_replace_previous() {
        let store = Store::open_in_memory().await.unwrap();
        let first = vec![DirectoryEntry {
            email: "a@example.com".to_string(),
            display_name: Some("A".to_string()),
            phone: None,
        }];
        let second = vec![DirectoryEntry {
            email: "b@example.com".to_string(),
            display_name: None,
            phone: Some("555".to_string()),
        }];

        store.save_directory_results(1, "tok", &first).await.unwrap();
        store.save_directory_results(1, "tok", &second).await.unwrap();

        assert_eq!(store.directory_results(1, "tok").await.unwrap(), second);
    }
}
