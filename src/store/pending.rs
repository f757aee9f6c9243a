//! Pending operation CRUD and state transitions.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::str::FromStr;

use super::Store;
use crate::pending::{
    AccountId, BlockReason, DeferUntil, Operation, PendingId, PendingOperation, State, StatusKind,
    Why, new_token,
};

const PENDING_COLUMNS: &str = "id, account_id, token, operation, state, server_id, parent_id, \
     dest_parent_id, display_name, folder_type, payload, response, predecessor_id, \
     defers_remaining, defer_until, defer_deadline, block_reason, why, last_status, \
     last_status_kind, created_at";

/// Which Deferred operations to return to Eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferRelease {
    /// Anytime deferrals, and timed ones whose deadline has passed.
    Due,
    /// Operations waiting for a folder hierarchy resync.
    AfterFolderSync,
    /// Operations waiting for an item resync.
    AfterSync,
}

fn parse_column<T: FromStr>(row: &SqliteRow, column: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.try_get(column)?;
    T::from_str(&text).with_context(|| format!("Invalid value in pending.{}", column))
}

fn parse_optional<T: FromStr>(row: &SqliteRow, column: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: Option<String> = row.try_get(column)?;
    text.map(|t| T::from_str(&t))
        .transpose()
        .with_context(|| format!("Invalid value in pending.{}", column))
}

fn pending_from_row(row: &SqliteRow) -> Result<PendingOperation> {
    let defer_kind: Option<String> = row.try_get("defer_until")?;
    let defer_deadline: Option<i64> = row.try_get("defer_deadline")?;
    let defer_until = defer_kind
        .map(|kind| DeferUntil::from_columns(&kind, defer_deadline))
        .transpose()?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(PendingOperation {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        token: row.try_get("token")?,
        operation: parse_column::<Operation>(row, "operation")?,
        state: parse_column::<State>(row, "state")?,
        server_id: row.try_get("server_id")?,
        parent_id: row.try_get("parent_id")?,
        dest_parent_id: row.try_get("dest_parent_id")?,
        display_name: row.try_get("display_name")?,
        folder_type: row.try_get::<Option<i64>, _>("folder_type")?.map(|t| t as u32),
        payload: row.try_get("payload")?,
        response: row.try_get::<Option<i64>, _>("response")?.map(|r| r as u32),
        predecessor_id: row.try_get("predecessor_id")?,
        defers_remaining: row.try_get::<i64, _>("defers_remaining")?.max(0) as u32,
        defer_until,
        block_reason: parse_optional::<BlockReason>(row, "block_reason")?,
        why: parse_optional::<Why>(row, "why")?,
        last_status: row.try_get::<Option<i64>, _>("last_status")?.map(|s| s as u32),
        last_status_kind: parse_optional::<StatusKind>(row, "last_status_kind")?,
        created_at: Utc
            .timestamp_opt(created_at, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

impl Store {
    //
    // Pending Operation Operations
    //

    /// Insert a pending operation, assigning its id and (if empty) its token.
    /// An operation whose predecessor has not yet succeeded is stored
    /// PredecessorBlocked; one whose predecessor already failed is stored
    /// Deleted. The predecessor is read under the same write lock as the
    /// insert, so it cannot resolve in between.
    pub async fn insert_pending(&self, pending: &mut PendingOperation) -> Result<PendingId> {
        if pending.token.is_empty() {
            pending.token = new_token()?;
        }

        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context("Failed to begin pending insert")?;

        if let Some(pred_id) = pending.predecessor_id {
            let row = sqlx::query(&format!("SELECT {} FROM pending WHERE id = ?", PENDING_COLUMNS))
                .bind(pred_id)
                .fetch_optional(&mut *tx)
                .await?;
            match row.as_ref().map(pending_from_row).transpose()? {
                Some(pred) if pred.succeeded() => {}
                Some(pred) if pred.failed() => {
                    pending.state = State::Deleted;
                    pending.why = Some(Why::PredecessorFailed);
                }
                Some(_) => pending.state = State::PredecessorBlocked,
                None => {}
            }
        }

        let (defer_kind, defer_deadline) = match pending.defer_until {
            Some(until) => {
                let (kind, deadline) = until.to_columns();
                (Some(kind), deadline)
            }
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO pending (
                account_id, token, operation, state, server_id, parent_id, dest_parent_id,
                display_name, folder_type, payload, response, predecessor_id,
                defers_remaining, defer_until, defer_deadline, block_reason, why,
                last_status, last_status_kind, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(pending.account_id)
        .bind(&pending.token)
        .bind(pending.operation.as_str())
        .bind(pending.state.as_str())
        .bind(&pending.server_id)
        .bind(&pending.parent_id)
        .bind(&pending.dest_parent_id)
        .bind(&pending.display_name)
        .bind(pending.folder_type.map(i64::from))
        .bind(&pending.payload)
        .bind(pending.response.map(i64::from))
        .bind(pending.predecessor_id)
        .bind(i64::from(pending.defers_remaining))
        .bind(defer_kind)
        .bind(defer_deadline)
        .bind(pending.block_reason.map(|r| r.as_str()))
        .bind(pending.why.map(|w| w.as_str()))
        .bind(pending.last_status.map(i64::from))
        .bind(pending.last_status_kind.map(|k| k.as_str()))
        .bind(pending.created_at.timestamp())
        .execute(&mut *tx)
        .await
        .context("Failed to insert pending operation")?;

        tx.commit()
            .await
            .context("Failed to commit pending insert")?;

        pending.id = result.last_insert_rowid();
        Ok(pending.id)
    }

    pub async fn get_pending(&self, id: PendingId) -> Result<Option<PendingOperation>> {
        let row = sqlx::query(&format!("SELECT {} FROM pending WHERE id = ?", PENDING_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(pending_from_row).transpose()
    }

    pub async fn pending_by_token(
        &self,
        account_id: AccountId,
        token: &str,
    ) -> Result<Option<PendingOperation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pending WHERE account_id = ? AND token = ?",
            PENDING_COLUMNS
        ))
        .bind(account_id)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(pending_from_row).transpose()
    }

    pub async fn query_by_account_and_operation(
        &self,
        account_id: AccountId,
        operation: Operation,
    ) -> Result<Vec<PendingOperation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pending WHERE account_id = ? AND operation = ? ORDER BY id",
            PENDING_COLUMNS
        ))
        .bind(account_id)
        .bind(operation.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    /// All pending operations of an account, oldest first.
    pub async fn list_pending(&self, account_id: AccountId) -> Result<Vec<PendingOperation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pending WHERE account_id = ? ORDER BY id",
            PENDING_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    /// Eligible operations of the given kinds, oldest first.
    pub async fn eligible(
        &self,
        account_id: AccountId,
        operations: &[Operation],
        limit: usize,
    ) -> Result<Vec<PendingOperation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.in_state(account_id, State::Eligible, operations, Some(limit))
            .await
    }

    async fn in_state(
        &self,
        account_id: AccountId,
        state: State,
        operations: &[Operation],
        limit: Option<usize>,
    ) -> Result<Vec<PendingOperation>> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; operations.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM pending WHERE account_id = ? AND state = ? AND operation IN ({}) \
             ORDER BY id LIMIT ?",
            PENDING_COLUMNS, placeholders
        );

        let mut query = sqlx::query(&sql).bind(account_id).bind(state.as_str());
        for op in operations {
            query = query.bind(op.as_str());
        }
        // SQLite treats a negative limit as no limit.
        let limit = limit.map_or(-1, |limit| limit as i64);
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        rows.iter().map(pending_from_row).collect()
    }

    /// PredecessorBlocked operations of the given kinds, oldest first.
    pub async fn predecessor_blocked(
        &self,
        account_id: AccountId,
        operations: &[Operation],
    ) -> Result<Vec<PendingOperation>> {
        self.in_state(account_id, State::PredecessorBlocked, operations, None)
            .await
    }

    /// Operations waiting on `predecessor`.
    pub async fn successors(&self, predecessor: PendingId) -> Result<Vec<PendingOperation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pending WHERE predecessor_id = ? ORDER BY id",
            PENDING_COLUMNS
        ))
        .bind(predecessor)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    /// Number of Dispatched operations of the given kinds.
    pub async fn count_dispatched(
        &self,
        account_id: AccountId,
        operations: &[Operation],
    ) -> Result<i64> {
        if operations.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; operations.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(*) AS n FROM pending WHERE account_id = ? AND state = ? \
             AND operation IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(account_id)
            .bind(State::Dispatched.as_str());
        for op in operations {
            query = query.bind(op.as_str());
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.get("n"))
    }

    /// Write the resolution columns of `pending` if its stored state is still
    /// `expected`. Returns false when another path got there first.
    /// Identity columns are left alone so a concurrent identity rewrite is kept.
    pub async fn transition_pending(
        &self,
        pending: &PendingOperation,
        expected: State,
    ) -> Result<bool> {
        let (defer_kind, defer_deadline) = match pending.defer_until {
            Some(until) => {
                let (kind, deadline) = until.to_columns();
                (Some(kind), deadline)
            }
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE pending SET
                state = ?, defers_remaining = ?, defer_until = ?, defer_deadline = ?,
                block_reason = ?, why = ?, last_status = ?, last_status_kind = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(pending.state.as_str())
        .bind(i64::from(pending.defers_remaining))
        .bind(defer_kind)
        .bind(defer_deadline)
        .bind(pending.block_reason.map(|r| r.as_str()))
        .bind(pending.why.map(|w| w.as_str()))
        .bind(pending.last_status.map(i64::from))
        .bind(pending.last_status_kind.map(|k| k.as_str()))
        .bind(pending.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to transition pending operation")?;

        Ok(result.rows_affected() == 1)
    }

    /// Overwrite the user-editable fields of a pending operation.
    pub async fn update_pending(&self, pending: &PendingOperation) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pending SET
                server_id = ?, parent_id = ?, dest_parent_id = ?, display_name = ?,
                folder_type = ?, payload = ?, response = ?
            WHERE id = ?
            "#,
        )
        .bind(&pending.server_id)
        .bind(&pending.parent_id)
        .bind(&pending.dest_parent_id)
        .bind(&pending.display_name)
        .bind(pending.folder_type.map(i64::from))
        .bind(&pending.payload)
        .bind(pending.response.map(i64::from))
        .bind(pending.id)
        .execute(&self.pool)
        .await
        .context("Failed to update pending operation")?;

        Ok(())
    }

    /// Return Deferred operations whose condition is met to Eligible.
    pub async fn release_deferred(&self, account_id: AccountId, release: DeferRelease) -> Result<u64> {
        let sql = match release {
            DeferRelease::Due => {
                "UPDATE pending SET state = 'eligible', defer_until = NULL, defer_deadline = NULL \
                 WHERE account_id = ? AND state = 'deferred' \
                 AND (defer_until = 'anytime' OR (defer_until = 'time' AND defer_deadline <= ?))"
            }
            DeferRelease::AfterFolderSync => {
                "UPDATE pending SET state = 'eligible', defer_until = NULL, defer_deadline = NULL \
                 WHERE account_id = ? AND state = 'deferred' AND defer_until = 'folder_sync'"
            }
            DeferRelease::AfterSync => {
                "UPDATE pending SET state = 'eligible', defer_until = NULL, defer_deadline = NULL \
                 WHERE account_id = ? AND state = 'deferred' AND defer_until = 'sync'"
            }
        };

        let query = sqlx::query(sql).bind(account_id);
        let query = match release {
            DeferRelease::Due => query.bind(Utc::now().timestamp()),
            _ => query,
        };
        let result = query
            .execute(&self.pool)
            .await
            .context("Failed to release deferred operations")?;

        Ok(result.rows_affected())
    }

    /// Return operations left Dispatched by an interrupted run to Eligible.
    pub async fn recover_dispatched(&self, account_id: AccountId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE pending SET state = 'eligible' WHERE account_id = ? AND state = 'dispatched'",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await
        .context("Failed to recover dispatched operations")?;

        Ok(result.rows_affected())
    }
}
