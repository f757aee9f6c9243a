//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

/// Initialize database schema with all tables and indexes.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Queued local mutations
        CREATE TABLE IF NOT EXISTS pending (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            token TEXT NOT NULL UNIQUE,
            operation TEXT NOT NULL,
            state TEXT NOT NULL,
            server_id TEXT,
            parent_id TEXT,
            dest_parent_id TEXT,
            display_name TEXT,
            folder_type INTEGER,
            payload TEXT,
            response INTEGER,
            predecessor_id INTEGER,
            defers_remaining INTEGER NOT NULL DEFAULT 0,
            defer_until TEXT,
            defer_deadline INTEGER,
            block_reason TEXT,
            why TEXT,
            last_status INTEGER,
            last_status_kind TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_account_state ON pending(account_id, state);
        CREATE INDEX IF NOT EXISTS idx_pending_account_operation ON pending(account_id, operation);
        CREATE INDEX IF NOT EXISTS idx_pending_predecessor ON pending(predecessor_id);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        -- Per-account protocol cursor
        CREATE TABLE IF NOT EXISTS protocol_state (
            account_id INTEGER PRIMARY KEY,
            revision INTEGER NOT NULL DEFAULT 0,
            folder_sync_key TEXT NOT NULL,
            policy_key TEXT NOT NULL,
            protocol_version TEXT NOT NULL,
            folder_sync_epoch INTEGER NOT NULL DEFAULT 0,
            heartbeat_secs INTEGER NOT NULL,
            max_folders INTEGER NOT NULL,
            wipe_required INTEGER NOT NULL DEFAULT 0,
            consecutive_401 INTEGER NOT NULL DEFAULT 0,
            capabilities INTEGER NOT NULL DEFAULT 0
        );

        -- Local mirror of the folder hierarchy
        CREATE TABLE IF NOT EXISTS folders (
            account_id INTEGER NOT NULL,
            server_id TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            folder_type INTEGER NOT NULL,
            sync_key TEXT NOT NULL DEFAULT '0',
            awaiting_create INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, server_id)
        );

        CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(account_id, parent_id);

        -- Local items referenced by pending operations
        CREATE TABLE IF NOT EXISTS items (
            account_id INTEGER NOT NULL,
            server_id TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            class TEXT NOT NULL,
            payload TEXT,
            awaiting_create INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, server_id)
        );

        CREATE INDEX IF NOT EXISTS idx_items_parent ON items(account_id, parent_id);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        -- Downloaded attachment content
        CREATE TABLE IF NOT EXISTS attachments (
            account_id INTEGER NOT NULL,
            file_reference TEXT NOT NULL,
            content_type TEXT,
            data BLOB NOT NULL,
            fetched_at INTEGER NOT NULL,
            PRIMARY KEY (account_id, file_reference)
        );

        -- Directory (GAL) search results, keyed by the search's token
        CREATE TABLE IF NOT EXISTS directory_results (
            account_id INTEGER NOT NULL,
            search_token TEXT NOT NULL,
            email TEXT NOT NULL,
            display_name TEXT,
            phone TEXT,
            PRIMARY KEY (account_id, search_token, email)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (1)")
        .execute(pool)
        .await?;

    Ok(())
}
