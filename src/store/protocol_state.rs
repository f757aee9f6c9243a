//! Protocol state persistence with optimistic commit.

use anyhow::{Context, Result};
use sqlx::Row;

use super::Store;
use crate::pending::AccountId;
use crate::protocol::{Capabilities, ProtocolState};

/// A commit lost the race against another writer of the same account's state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol state for account {account_id} changed since revision {revision}")]
pub struct StaleProtocolState {
    pub account_id: AccountId,
    pub revision: i64,
}

impl Store {
    //
    // Protocol State Operations
    //

    /// Load an account's protocol state, creating the initial one if absent.
    pub async fn protocol_state(
        &self,
        account_id: AccountId,
        default_version: &str,
    ) -> Result<ProtocolState> {
        let row = sqlx::query(
            r#"
            SELECT revision, folder_sync_key, policy_key, protocol_version, folder_sync_epoch,
                   heartbeat_secs, max_folders, wipe_required, consecutive_401, capabilities
            FROM protocol_state WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            let state = ProtocolState::initial(account_id, default_version);
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO protocol_state (
                    account_id, revision, folder_sync_key, policy_key, protocol_version,
                    folder_sync_epoch, heartbeat_secs, max_folders, wipe_required,
                    consecutive_401, capabilities
                ) VALUES (?, 0, ?, ?, ?, 0, ?, ?, 0, 0, 0)
                "#,
            )
            .bind(account_id)
            .bind(&state.folder_sync_key)
            .bind(&state.policy_key)
            .bind(&state.protocol_version)
            .bind(i64::from(state.heartbeat_secs))
            .bind(i64::from(state.max_folders))
            .execute(&self.pool)
            .await
            .context("Failed to create protocol state")?;
            return Ok(state);
        };

        Ok(ProtocolState {
            account_id,
            revision: row.get("revision"),
            folder_sync_key: row.get("folder_sync_key"),
            policy_key: row.get("policy_key"),
            protocol_version: row.get("protocol_version"),
            folder_sync_epoch: row.get::<i64, _>("folder_sync_epoch") as u32,
            heartbeat_secs: row.get::<i64, _>("heartbeat_secs") as u32,
            max_folders: row.get::<i64, _>("max_folders") as u32,
            wipe_required: row.get::<i64, _>("wipe_required") != 0,
            consecutive_401: row.get::<i64, _>("consecutive_401") as u32,
            capabilities: Capabilities::from_bits_truncate(row.get::<i64, _>("capabilities") as u32),
        })
    }

    /// Commit `state` if nobody else committed since it was read.
    /// Returns the state with its new revision, or `StaleProtocolState`.
    pub async fn commit_protocol_state(&self, state: &ProtocolState) -> Result<ProtocolState> {
        let result = sqlx::query(
            r#"
            UPDATE protocol_state SET
                revision = revision + 1,
                folder_sync_key = ?, policy_key = ?, protocol_version = ?,
                folder_sync_epoch = ?, heartbeat_secs = ?, max_folders = ?,
                wipe_required = ?, consecutive_401 = ?, capabilities = ?
            WHERE account_id = ? AND revision = ?
            "#,
        )
        .bind(&state.folder_sync_key)
        .bind(&state.policy_key)
        .bind(&state.protocol_version)
        .bind(i64::from(state.folder_sync_epoch))
        .bind(i64::from(state.heartbeat_secs))
        .bind(i64::from(state.max_folders))
        .bind(state.wipe_required as i64)
        .bind(i64::from(state.consecutive_401))
        .bind(i64::from(state.capabilities.bits()))
        .bind(state.account_id)
        .bind(state.revision)
        .execute(&self.pool)
        .await
        .context("Failed to commit protocol state")?;

        if result.rows_affected() != 1 {
            return Err(StaleProtocolState {
                account_id: state.account_id,
                revision: state.revision,
            }
            .into());
        }

        let mut committed = state.clone();
        committed.revision += 1;
        Ok(committed)
    }
}
