use anyhow::{Result, anyhow};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AccountSession, ControllerEvent, ControllerHandle, EngineContext, spawn_controller};
use crate::constants::{EVENT_CHANNEL_CAPACITY, FOLDER_TYPE_USER_MAIL};
use crate::pending::{
    AccountId, Operation, PendingOperation, State, is_placeholder, new_placeholder,
};
use crate::store::{LocalFolder, LocalItem};

/// Owns one controller per running account and is the entry point for
/// queueing and cancelling work.
pub struct Engine {
    cx: EngineContext,
    controllers: HashMap<AccountId, ControllerHandle>,
    events_tx: mpsc::Sender<ControllerEvent>,
    events_rx: Option<mpsc::Receiver<ControllerEvent>>,
    /// Parent of every account's token; cancelled on shutdown.
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(cx: EngineContext) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            cx,
            controllers: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.cx
    }

    /// Take the stream of command outcomes from every account. Only the first
    /// caller gets it.
    pub fn events(&mut self) -> Option<mpsc::Receiver<ControllerEvent>> {
        self.events_rx.take()
    }

    /// Start a controller for the session's account.
    pub fn start(&mut self, session: AccountSession) -> Result<()> {
        let account_id = session.account_id;
        if let Some(existing) = self.controllers.get(&account_id) {
            if !existing.is_finished() {
                anyhow::bail!("Account {} is already running", account_id);
            }
        }

        let handle = spawn_controller(
            self.cx.clone(),
            session,
            self.events_tx.clone(),
            &self.shutdown,
        );
        self.controllers.insert(account_id, handle);
        tracing::info!("Started account {}", account_id);
        Ok(())
    }

    /// Stop one account, returning its in-flight operations to the queue.
    pub async fn stop(&mut self, account_id: AccountId) -> bool {
        match self.controllers.remove(&account_id) {
            Some(handle) => {
                handle.shutdown().await;
                tracing::info!("Stopped account {}", account_id);
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for (_, handle) in self.controllers.drain() {
            handle.shutdown().await;
        }
    }

    pub fn is_running(&self, account_id: AccountId) -> bool {
        self.controllers
            .get(&account_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    fn nudge(&self, account_id: AccountId) {
        if let Some(handle) = self.controllers.get(&account_id) {
            handle.nudge();
        }
    }

    /// Persist a new pending operation and wake its account. `defers` sets
    /// how many times it may be deferred; `None` uses the engine default.
    pub async fn enqueue(
        &self,
        mut pending: PendingOperation,
        defers: Option<u32>,
    ) -> Result<PendingOperation> {
        pending.defers_remaining = defers.unwrap_or(self.cx.policy.default_defers);
        self.cx.store.insert_pending(&mut pending).await?;
        tracing::debug!(
            "[account {}] Queued {} {}",
            pending.account_id,
            pending.operation,
            pending.token
        );
        self.nudge(pending.account_id);
        Ok(pending)
    }

    /// Create a folder locally under a placeholder id and queue its creation
    /// on the server.
    pub async fn create_folder(
        &self,
        account_id: AccountId,
        parent_id: &str,
        display_name: &str,
        folder_type: Option<u32>,
    ) -> Result<PendingOperation> {
        let placeholder = new_placeholder()?;
        let folder_type = folder_type.unwrap_or(FOLDER_TYPE_USER_MAIL);
        self.cx
            .store
            .insert_folder(&LocalFolder::awaiting_create(
                account_id,
                &placeholder,
                parent_id,
                display_name,
                folder_type,
            ))
            .await?;

        self.enqueue(
            PendingOperation::new(account_id, Operation::FolderCreate)
                .with_server_id(placeholder)
                .with_parent(parent_id)
                .with_display_name(display_name)
                .with_folder_type(folder_type),
            None,
        )
        .await
    }

    /// Create a calendar item locally and queue its upload.
    pub async fn create_calendar_item(
        &self,
        account_id: AccountId,
        calendar_id: &str,
        payload: &str,
    ) -> Result<PendingOperation> {
        let placeholder = new_placeholder()?;
        let mut item = LocalItem::new(account_id, &placeholder, calendar_id, "Calendar");
        item.payload = Some(payload.to_string());
        item.awaiting_create = true;
        self.cx.store.insert_item(&item).await?;

        self.enqueue(
            PendingOperation::new(account_id, Operation::CalCreate)
                .with_server_id(placeholder)
                .with_parent(calendar_id)
                .with_payload(payload),
            None,
        )
        .await
    }

    /// Withdraw a pending operation by its token. Returns false if it had
    /// already been resolved.
    pub async fn cancel(&self, account_id: AccountId, token: &str) -> Result<bool> {
        match self.controllers.get(&account_id) {
            Some(handle) if !handle.is_finished() => handle.cancel_pending(token).await,
            _ => self.cx.resolver().withdraw(account_id, token).await,
        }
    }

    /// Retry an operation the user was asked to fix, optionally with a new
    /// name or parent.
    pub async fn retry_blocked(
        &self,
        account_id: AccountId,
        token: &str,
        new_name: Option<&str>,
        new_parent: Option<&str>,
    ) -> Result<bool> {
        let mut pending = self
            .cx
            .store
            .pending_by_token(account_id, token)
            .await?
            .ok_or_else(|| anyhow!("No pending operation {} for account {}", token, account_id))?;
        if pending.state != State::UserBlocked {
            return Ok(false);
        }

        if let Some(name) = new_name {
            pending.display_name = Some(name.to_string());
        }
        if let Some(parent) = new_parent {
            pending.parent_id = Some(parent.to_string());
        }
        self.cx.store.update_pending(&pending).await?;

        if pending.operation == Operation::FolderCreate {
            if let Some(placeholder) = pending.server_id.as_deref().filter(|id| is_placeholder(id)) {
                if let Some(folder) = self.cx.store.folder(account_id, placeholder).await? {
                    self.cx
                        .store
                        .update_folder(
                            account_id,
                            placeholder,
                            pending.parent_id.as_deref().unwrap_or(folder.parent_id.as_str()),
                            pending.display_name.as_deref().unwrap_or(folder.display_name.as_str()),
                        )
                        .await?;
                }
            }
        }

        let released = self.cx.resolver().release_blocked(&mut pending).await?;
        if released {
            self.nudge(account_id);
        }
        Ok(released)
    }

    pub async fn credentials_updated(&self, account_id: AccountId) -> Result<()> {
        match self.controllers.get(&account_id) {
            Some(handle) => handle.credentials_updated().await,
            None => Err(anyhow!("Account {} is not running", account_id)),
        }
    }
}
