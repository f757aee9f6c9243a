//! Per-account driving controller: picks the next command, runs it, and
//! reacts to the event it reports.

use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::EngineContext;
use crate::command::{
    CommandKind, Executor, FolderCreate, FolderDelete, FolderUpdate, ItemOperations,
    MeetingResponse, MoveItems, Options, Ping, Provision, Search, SendMail, SyncUpload, Wait,
    WatchedFolder,
};
use crate::constants::CONTROLLER_CHANNEL_CAPACITY;
use crate::notification::OutcomeSummary;
use crate::pending::{AccountId, PendingId, State};
use crate::protocol::{Capabilities, Event, EventKind, Transport};
use crate::retry::Backoff;
use crate::store::DeferRelease;

/// What a controller needs to serve one account.
pub struct AccountSession {
    pub account_id: AccountId,
    pub transport: Arc<dyn Transport>,
    /// Folders the long-poll watches; empty means the local wait is used.
    pub watch_folders: Vec<String>,
}

/// Commands that can be sent to a running controller.
#[derive(Debug)]
pub enum ControllerCommand {
    /// Withdraw a pending operation, interrupting the running command if it
    /// holds it.
    CancelPending {
        token: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    /// New credentials are available; resume if parked on an auth failure.
    CredentialsUpdated,
}

/// One command's outcome, as observed by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEvent {
    pub account_id: AccountId,
    pub command: &'static str,
    pub event: Event,
}

/// Handle to a spawned controller.
pub struct ControllerHandle {
    pub account_id: AccountId,
    cmd_tx: mpsc::Sender<ControllerCommand>,
    nudge: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Wake the controller because local work was queued.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    pub async fn cancel_pending(&self, token: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ControllerCommand::CancelPending {
                token: token.to_string(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("Controller for account {} has stopped", self.account_id))?;
        rx.await
            .map_err(|_| anyhow!("Controller for account {} dropped the request", self.account_id))?
    }

    pub async fn credentials_updated(&self) -> Result<()> {
        self.cmd_tx
            .send(ControllerCommand::CredentialsUpdated)
            .await
            .map_err(|_| anyhow!("Controller for account {} has stopped", self.account_id))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the account and wait for the controller to exit. A command in
    /// flight returns its claimed operations before the task ends.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Controller for account {} panicked: {}", self.account_id, e);
        }
    }
}

/// Spawn the controller for one account. Cancelling `parent` stops it.
pub fn spawn_controller(
    cx: EngineContext,
    session: AccountSession,
    events: mpsc::Sender<ControllerEvent>,
    parent: &CancellationToken,
) -> ControllerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(CONTROLLER_CHANNEL_CAPACITY);
    let nudge = Arc::new(Notify::new());
    let cancel = parent.child_token();
    let account_id = session.account_id;

    let controller = Controller {
        account_id,
        executor: Executor::new(account_id, cx.clone(), session.transport),
        backoff: Backoff::new(&cx.policy.wire.retry),
        cx,
        watch_folders: session.watch_folders,
        nudge: Arc::clone(&nudge),
        cancel: cancel.clone(),
        events,
        needs_discovery: false,
        needs_provision: false,
        parked: false,
    };
    let task = tokio::spawn(controller.run(cmd_rx));

    ControllerHandle {
        account_id,
        cmd_tx,
        nudge,
        cancel,
        task,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// What one command run left behind.
struct Ran {
    event: Event,
    /// Ended early to pick up new local work.
    interrupted: bool,
    /// Operations the command held when it started.
    held: Vec<PendingId>,
}

struct Controller {
    account_id: AccountId,
    cx: EngineContext,
    executor: Executor,
    watch_folders: Vec<String>,
    nudge: Arc<Notify>,
    /// Account-wide; each command runs under a child of it.
    cancel: CancellationToken,
    events: mpsc::Sender<ControllerEvent>,
    backoff: Backoff,
    needs_discovery: bool,
    needs_provision: bool,
    /// Waiting for new credentials after an auth failure.
    parked: bool,
}

impl Controller {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ControllerCommand>) {
        tracing::info!("[account {}] Controller started", self.account_id);

        match self.cx.store.recover_dispatched(self.account_id).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(
                "[account {}] Returned {} interrupted operation(s) to the queue",
                self.account_id,
                n
            ),
            Err(e) => tracing::error!("[account {}] Recovery failed: {:#}", self.account_id, e),
        }
        match self
            .cx
            .store
            .protocol_state(self.account_id, &self.cx.policy.protocol_version)
            .await
        {
            Ok(state) => self.needs_discovery = state.capabilities.is_empty(),
            Err(e) => {
                tracing::error!("[account {}] Could not load state: {:#}", self.account_id, e);
                self.needs_discovery = true;
            }
        }

        while !self.cancel.is_cancelled() {
            if self.parked {
                tracing::info!("[account {}] Waiting for new credentials", self.account_id);
                if self.idle(&mut cmd_rx, None).await == Flow::Stop {
                    break;
                }
                continue;
            }

            let command = match self.next_command().await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(
                        "[account {}] Could not schedule a command: {:#}",
                        self.account_id,
                        e
                    );
                    let delay = self.backoff.next_delay();
                    if self.idle(&mut cmd_rx, Some(delay)).await == Flow::Stop {
                        break;
                    }
                    continue;
                }
            };

            let ran = self.execute(&command, &mut cmd_rx).await;
            self.emit(command.name(), &ran.event);
            if self.react(&command, &ran, &mut cmd_rx).await == Flow::Stop {
                break;
            }
        }

        tracing::info!("[account {}] Controller stopped", self.account_id);
    }

    /// Pick the next command: discovery and provisioning first, then queued
    /// work in a fixed order, then a long-poll.
    async fn next_command(&self) -> Result<Option<CommandKind>> {
        let account_id = self.account_id;
        let store = &self.cx.store;
        let resolver = self.cx.resolver();
        let state = store
            .protocol_state(account_id, &self.cx.policy.protocol_version)
            .await?;

        if state.wipe_required {
            tracing::warn!("[account {}] Remote wipe pending, not syncing", account_id);
            return Ok(None);
        }
        if self.needs_discovery {
            return Ok(Some(CommandKind::Options(Options::new(resolver))));
        }
        if (self.needs_provision || !state.is_provisioned())
            && state.allows(Capabilities::PROVISION)
        {
            return Ok(Some(CommandKind::Provision(Provision::new(resolver))));
        }

        let released = store.release_deferred(account_id, DeferRelease::Due).await?;
        if released > 0 {
            tracing::debug!("[account {}] Released {} deferred operation(s)", account_id, released);
        }

        macro_rules! offer {
            ($command:expr) => {
                let command = $command;
                if command.has_work().await {
                    return Ok(Some(command));
                }
            };
        }

        offer!(CommandKind::FolderCreate(FolderCreate::claim(resolver.clone(), account_id).await?));
        offer!(CommandKind::FolderUpdate(FolderUpdate::claim(resolver.clone(), account_id).await?));
        offer!(CommandKind::FolderDelete(FolderDelete::claim(resolver.clone(), account_id).await?));
        offer!(CommandKind::MoveItems(
            MoveItems::claim(resolver.clone(), account_id, self.cx.policy.move_batch).await?
        ));
        offer!(CommandKind::SyncUpload(SyncUpload::claim(resolver.clone(), account_id).await?));
        offer!(CommandKind::SendMail(SendMail::claim(resolver.clone(), account_id).await?));
        offer!(CommandKind::MeetingResponse(
            MeetingResponse::claim(resolver.clone(), account_id).await?
        ));
        offer!(CommandKind::ItemOperations(
            ItemOperations::claim(resolver.clone(), account_id).await?
        ));
        offer!(CommandKind::Search(Search::claim(resolver.clone(), account_id).await?));

        if !self.watch_folders.is_empty() && state.allows(Capabilities::PING) {
            let mut folders = Vec::with_capacity(self.watch_folders.len());
            for server_id in &self.watch_folders {
                let folder_type = store
                    .folder(account_id, server_id)
                    .await?
                    .map(|f| f.folder_type);
                folders.push(WatchedFolder::new(server_id.clone(), folder_type));
            }
            return Ok(Some(CommandKind::Ping(Ping::new(resolver, folders))));
        }

        Ok(Some(CommandKind::Wait(Wait::new(
            self.cx.policy.wait_interval,
            Arc::clone(&self.nudge),
        ))))
    }

    /// Run one command while still serving cancel requests.
    async fn execute(
        &self,
        command: &CommandKind,
        cmd_rx: &mut mpsc::Receiver<ControllerCommand>,
    ) -> Ran {
        let cancel = self.cancel.child_token();
        let held: Vec<PendingId> = match command.queue() {
            Some(queue) => queue.snapshot().await.iter().map(|p| p.id).collect(),
            None => Vec::new(),
        };
        let interruptible = matches!(command, CommandKind::Ping(_));
        let mut interrupted = false;
        let mut withdraw_after = Vec::new();

        let event = {
            let exec = command.execute(&self.executor, &cancel);
            tokio::pin!(exec);

            loop {
                tokio::select! {
                    biased;
                    event = &mut exec => break event,
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        ControllerCommand::CancelPending { token, reply } => {
                            let result = self
                                .cancel_pending(command, &held, &cancel, &token, &mut withdraw_after)
                                .await;
                            if reply.send(result).is_err() {
                                tracing::debug!("Cancel requester went away");
                            }
                        }
                        ControllerCommand::CredentialsUpdated => {
                            tracing::debug!("[account {}] Credentials updated while running", self.account_id);
                        }
                    },
                    _ = self.nudge.notified(), if interruptible && !interrupted => {
                        tracing::debug!("[account {}] Local work queued, ending {}", self.account_id, command.name());
                        interrupted = true;
                        cancel.cancel();
                    }
                }
            }
        };

        let resolver = self.cx.resolver();
        for token in withdraw_after {
            match resolver.withdraw(self.account_id, &token).await {
                Ok(true) => tracing::info!("[account {}] Withdrew {}", self.account_id, token),
                Ok(false) => tracing::debug!("{} completed before it could be withdrawn", token),
                Err(e) => tracing::warn!("Failed to withdraw {}: {:#}", token, e),
            }
        }

        Ran {
            event,
            interrupted,
            held,
        }
    }

    async fn cancel_pending(
        &self,
        command: &CommandKind,
        held: &[PendingId],
        cancel: &CancellationToken,
        token: &str,
        withdraw_after: &mut Vec<String>,
    ) -> Result<bool> {
        let resolver = self.cx.resolver();
        if resolver.withdraw(self.account_id, token).await? {
            return Ok(true);
        }
        let Some(pending) = self.cx.store.pending_by_token(self.account_id, token).await? else {
            return Ok(false);
        };
        if !held.contains(&pending.id) {
            return Ok(false);
        }

        tracing::info!(
            "[account {}] Cancelling {} to withdraw {}",
            self.account_id,
            command.name(),
            token
        );
        cancel.cancel();
        withdraw_after.push(token.to_string());
        Ok(true)
    }

    fn emit(&self, command: &'static str, event: &Event) {
        let message = ControllerEvent {
            account_id: self.account_id,
            command,
            event: event.clone(),
        };
        if let Err(e) = self.events.try_send(message) {
            tracing::debug!("Controller event dropped: {}", e);
        }
    }

    async fn react(
        &mut self,
        command: &CommandKind,
        ran: &Ran,
        cmd_rx: &mut mpsc::Receiver<ControllerCommand>,
    ) -> Flow {
        let account_id = self.account_id;
        let event = &ran.event;
        if event.kind.is_control() {
            tracing::info!("[account {}] {} requested {:?}", account_id, command.name(), event.kind);
        }
        match event.kind {
            EventKind::Success => {
                self.backoff.reset();
                match command {
                    CommandKind::Options(_) => self.needs_discovery = false,
                    CommandKind::Provision(_) => self.needs_provision = false,
                    _ => {}
                }
                return Flow::Continue;
            }
            EventKind::TempFail if ran.interrupted || self.cancel.is_cancelled() => {
                return Flow::Continue;
            }
            EventKind::TempFail => return self.back_off(cmd_rx).await,
            EventKind::HardFail => {
                // Failures of the session-level commands would otherwise spin.
                if matches!(
                    command,
                    CommandKind::Options(_) | CommandKind::Provision(_) | CommandKind::Ping(_)
                ) {
                    return self.back_off(cmd_rx).await;
                }
            }
            EventKind::ReSync => self.release(DeferRelease::AfterSync).await,
            EventKind::ReFolderSync => {
                if let Err(e) = self.bump_folder_epoch().await {
                    tracing::warn!("[account {}] Could not bump folder epoch: {:#}", account_id, e);
                }
                self.release(DeferRelease::AfterFolderSync).await;
                self.cx.sink.notify(account_id, OutcomeSummary::FolderListChanged);
            }
            EventKind::ReProvision => self.needs_provision = true,
            EventKind::ReDiscover => self.needs_discovery = true,
            EventKind::AuthFail => {
                tracing::warn!("[account {}] Authentication failed", account_id);
                self.parked = true;
                return Flow::Continue;
            }
            EventKind::Wipe => {
                tracing::warn!("[account {}] Stopping for remote wipe", account_id);
                return Flow::Stop;
            }
        }

        // Operations handed straight back to the queue would be claimed and
        // resent on the next pass.
        if self.requeued_any(&ran.held).await {
            tracing::debug!(
                "[account {}] {} returned its operations to the queue",
                account_id,
                command.name()
            );
            return self.back_off(cmd_rx).await;
        }
        Flow::Continue
    }

    async fn requeued_any(&self, held: &[PendingId]) -> bool {
        for id in held {
            match self.cx.store.get_pending(*id).await {
                Ok(Some(pending)) if pending.state == State::Eligible => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("[account {}] Could not read pending {}: {:#}", self.account_id, id, e);
                    return true;
                }
            }
        }
        false
    }

    async fn back_off(&mut self, cmd_rx: &mut mpsc::Receiver<ControllerCommand>) -> Flow {
        let delay = self.backoff.next_delay();
        tracing::debug!("[account {}] Backing off for {:?}", self.account_id, delay);
        self.idle(cmd_rx, Some(delay)).await
    }

    /// Sleep for `delay` (forever if None) unless woken by new work, new
    /// credentials or the account stopping.
    async fn idle(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<ControllerCommand>,
        delay: Option<Duration>,
    ) -> Flow {
        let sleep = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Flow::Stop,
                cmd = cmd_rx.recv() => match cmd {
                    Some(ControllerCommand::CancelPending { token, reply }) => {
                        let result = self.cx.resolver().withdraw(self.account_id, &token).await;
                        if reply.send(result).is_err() {
                            tracing::debug!("Cancel requester went away");
                        }
                    }
                    Some(ControllerCommand::CredentialsUpdated) => {
                        self.parked = false;
                        return Flow::Continue;
                    }
                    None => return Flow::Stop,
                },
                _ = self.nudge.notified(), if !self.parked => return Flow::Continue,
                _ = &mut sleep => return Flow::Continue,
            }
        }
    }

    async fn release(&self, release: DeferRelease) {
        match self.cx.store.release_deferred(self.account_id, release).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(
                "[account {}] Released {} operation(s) waiting for {:?}",
                self.account_id,
                n,
                release
            ),
            Err(e) => tracing::warn!("[account {}] Release failed: {:#}", self.account_id, e),
        }
    }

    async fn bump_folder_epoch(&self) -> Result<()> {
        let mut state = self
            .cx
            .store
            .protocol_state(self.account_id, &self.cx.policy.protocol_version)
            .await?;
        state.folder_sync_epoch += 1;
        self.cx.store.commit_protocol_state(&state).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{Operation, PendingOperation, Why};
    use crate::protocol::WireResponse;
    use crate::protocol::document::{Element, ns};
    use crate::protocol::{Document, ProtocolState};
    use crate::retry::RetryConfig;
    use crate::testing::{Harness, ScriptedTransport, json_response, test_policy};

    async fn provisioned_state(harness: &Harness) {
        let mut state: ProtocolState = harness.state().await;
        state.policy_key = "1".to_string();
        state.capabilities = Capabilities::all();
        harness.cx.store.commit_protocol_state(&state).await.unwrap();
    }

    fn spawn(
        harness: &Harness,
        transport: Arc<ScriptedTransport>,
    ) -> (ControllerHandle, mpsc::Receiver<ControllerEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let root = CancellationToken::new();
        let handle = spawn_controller(
            harness.cx.clone(),
            AccountSession {
                account_id: 1,
                transport,
                watch_folders: Vec::new(),
            },
            tx,
            &root,
        );
        (handle, rx, root)
    }

    #[tokio::test]
    async fn test_sends_queued_mail_then_waits() {
        let harness = Harness::new().await;
        provisioned_state(&harness).await;
        let mut send = PendingOperation::new(1, Operation::EmailSend).with_payload("MIME");
        harness.cx.store.insert_pending(&mut send).await.unwrap();
        harness.transport.push_response(WireResponse::new(200));

        let (handle, mut events, _root) = spawn(&harness, harness.transport.clone());

        let first = events.recv().await.unwrap();
        assert_eq!(first.command, "SendMail");
        assert_eq!(first.event.kind, EventKind::Success);
        assert!(harness.cx.store.get_pending(send.id).await.unwrap().unwrap().succeeded());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unprovisioned_account_provisions_first() {
        let harness = Harness::new().await;
        let mut state = harness.state().await;
        state.capabilities = Capabilities::all();
        harness.cx.store.commit_protocol_state(&state).await.unwrap();

        let body = Document::new(
            Element::new(ns::PROVISION, "Provision")
                .with_leaf(ns::PROVISION, "Status", "1")
                .with(
                    Element::new(ns::PROVISION, "Policies").with(
                        Element::new(ns::PROVISION, "Policy")
                            .with_leaf(ns::PROVISION, "Status", "1")
                            .with_leaf(ns::PROVISION, "PolicyKey", "77"),
                    ),
                ),
        );
        harness.transport.push_response(json_response(&body));

        let (handle, mut events, _root) = spawn(&harness, harness.transport.clone());

        let first = events.recv().await.unwrap();
        assert_eq!(first.command, "Provision");
        assert_eq!(harness.state().await.policy_key, "77");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_returns_claimed_operations() {
        let harness = Harness::new().await;
        provisioned_state(&harness).await;
        let mut send = PendingOperation::new(1, Operation::EmailSend).with_payload("MIME");
        harness.cx.store.insert_pending(&mut send).await.unwrap();
        harness.transport.push_hang();

        let (handle, _events, root) = spawn(&harness, harness.transport.clone());
        while harness.transport.attempts() == 0 {
            tokio::task::yield_now().await;
        }

        root.cancel();
        handle.shutdown().await;

        let stored = harness.cx.store.get_pending(send.id).await.unwrap().unwrap();
        assert_eq!(stored.state, State::Eligible);
    }

    #[tokio::test]
    async fn test_cancel_withdraws_operation_in_flight() {
        let harness = Harness::new().await;
        provisioned_state(&harness).await;
        let mut send = PendingOperation::new(1, Operation::EmailSend).with_payload("MIME");
        harness.cx.store.insert_pending(&mut send).await.unwrap();
        harness.transport.push_hang();

        let (handle, mut events, _root) = spawn(&harness, harness.transport.clone());
        while harness.transport.attempts() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(handle.cancel_pending(&send.token).await.unwrap());
        let event = events.recv().await.unwrap();
        assert_eq!(event.event.mnemonic, "CANCELLED");

        // Withdrawal follows the command's cleanup.
        loop {
            let stored = harness.cx.store.get_pending(send.id).await.unwrap().unwrap();
            if stored.state == State::Deleted {
                assert_eq!(stored.why, Some(crate::pending::Why::CancelledByUser));
                break;
            }
            tokio::task::yield_now().await;
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_auth_failure_parks_until_credentials_arrive() {
        let harness = Harness::new().await;
        provisioned_state(&harness).await;
        let mut send = PendingOperation::new(1, Operation::EmailSend).with_payload("MIME");
        harness.cx.store.insert_pending(&mut send).await.unwrap();
        harness.transport.push_response(WireResponse::new(401));
        harness.transport.push_response(WireResponse::new(200));

        let (handle, mut events, _root) = spawn(&harness, harness.transport.clone());

        let first = events.recv().await.unwrap();
        assert_eq!(first.event.kind, EventKind::AuthFail);
        handle.nudge();
        tokio::task::yield_now().await;
        assert_eq!(harness.transport.attempts(), 1);

        handle.credentials_updated().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(second.command, "SendMail");
        assert_eq!(second.event.kind, EventKind::Success);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_command_spends_defers_then_fails() {
        let harness = Harness::new().await;
        provisioned_state(&harness).await;
        let mut send = PendingOperation::new(1, Operation::EmailSend)
            .with_payload("MIME")
            .with_defers(3);
        harness.cx.store.insert_pending(&mut send).await.unwrap();
        for _ in 0..20 {
            harness.transport.push_response(WireResponse::new(501));
        }

        let (handle, _events, _root) = spawn(&harness, harness.transport.clone());
        let stored = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let stored = harness.cx.store.get_pending(send.id).await.unwrap().unwrap();
                if stored.is_terminal() {
                    break stored;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(stored.state, State::Failed);
        assert_eq!(stored.why, Some(Why::ProtocolError));
        // The first send plus one per defer.
        assert_eq!(harness.transport.attempts(), 4);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_control_reset_backs_off_before_resending() {
        let mut policy = test_policy();
        policy.wire.retry =
            RetryConfig::new(3, Duration::from_secs(3600), Duration::from_secs(3600));
        let harness = Harness::with_policy(policy).await;
        provisioned_state(&harness).await;
        let mut send = PendingOperation::new(1, Operation::EmailSend)
            .with_payload("MIME")
            .with_defers(3);
        harness.cx.store.insert_pending(&mut send).await.unwrap();
        let body = Document::new(
            Element::new(ns::COMPOSE_MAIL, "SendMail").with_leaf(ns::COMPOSE_MAIL, "Status", "132"),
        );
        for _ in 0..5 {
            harness.transport.push_response(json_response(&body));
        }

        let (handle, mut events, _root) = spawn(&harness, harness.transport.clone());

        let first = events.recv().await.unwrap();
        assert_eq!(first.event.kind, EventKind::ReSync);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(harness.transport.attempts(), 1);
        let stored = harness.cx.store.get_pending(send.id).await.unwrap().unwrap();
        assert_eq!(stored.state, State::Eligible);
        assert_eq!(stored.defers_remaining, 3);

        handle.shutdown().await;
    }
}
