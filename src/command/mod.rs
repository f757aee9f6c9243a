//! The command family.
//!
//! Each command builds one request from the pending operations it claimed and
//! the account's protocol state, and interprets the response. The shared
//! `Executor` owns everything else: the wire exchange, HTTP and top-level
//! status handling, state commits and cleanup of anything left unresolved.
//!
//! This module is split into:
//! - `executor.rs` - Runs one command end to end
//! - `http_status.rs` - HTTP status classification
//! - `folder.rs` - FolderCreate, FolderUpdate, FolderDelete
//! - `move_items.rs` - MoveItems
//! - `send_mail.rs` - SendMail
//! - `meeting_response.rs` - MeetingResponse
//! - `item_operations.rs` - ItemOperations attachment fetch
//! - `search.rs` - Directory search
//! - `sync_upload.rs` - Sync upload of locally created calendar items
//! - `provision.rs` - Provision
//! - `options.rs` - Capability discovery
//! - `ping.rs` - Ping long-poll
//! - `wait.rs` - Local long-poll without a server exchange

mod executor;
mod folder;
mod http_status;
mod item_operations;
mod meeting_response;
mod move_items;
mod options;
mod ping;
mod provision;
mod search;
mod send_mail;
mod sync_upload;
mod wait;

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::controller::EnginePolicy;
use crate::notification::NotificationSink;
use crate::pending::{AccountId, Operation, PendingOperation, PendingQueue};
use crate::protocol::{CodecError, Document, Event, Method, ProtocolState, Verdict};
use crate::store::Store;

pub use executor::Executor;
pub use folder::{FolderCreate, FolderDelete, FolderUpdate};
pub use item_operations::ItemOperations;
pub use meeting_response::MeetingResponse;
pub use move_items::MoveItems;
pub use options::Options;
pub use ping::{Ping, WatchedFolder};
pub use provision::Provision;
pub use search::Search;
pub use send_mail::SendMail;
pub use sync_upload::SyncUpload;
pub use wait::Wait;

/// Why a request could not be built. The claimed operations stay eligible.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{operation} is missing {field}")]
    MissingField {
        operation: Operation,
        field: &'static str,
    },
    #[error("{0} still refers to an object the server has not created")]
    UnresolvedPlaceholder(&'static str),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BuildError {
    pub(crate) fn missing(pending: &PendingOperation, field: &'static str) -> Self {
        BuildError::MissingField {
            operation: pending.operation,
            field,
        }
    }
}

/// What a response handler may read and change.
pub struct ResponseContext<'a> {
    pub account_id: AccountId,
    pub store: &'a Store,
    pub sink: &'a dyn NotificationSink,
    pub policy: &'a EnginePolicy,
    pub headers: &'a [(String, String)],
    /// Working copy of the protocol state, committed after the handler returns.
    pub state: ProtocolState,
}

impl ResponseContext<'_> {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub trait Command: Send + Sync {
    /// Protocol command name.
    fn name(&self) -> &'static str;

    fn queue(&self) -> &PendingQueue;

    /// Refuse to send a request when nothing was claimed.
    fn requires_pending(&self) -> bool {
        true
    }

    fn method(&self) -> Method {
        Method::Post
    }

    fn sends_policy_key(&self) -> bool {
        true
    }

    fn timeout(&self, _state: &ProtocolState, policy: &EnginePolicy) -> Duration {
        policy.wire.timeout
    }

    /// `None` sends no body.
    fn build_request(
        &self,
        state: &ProtocolState,
        pending: &[PendingOperation],
    ) -> Result<Option<Document>, BuildError>;

    /// Command-specific handling of a top-level status, consulted before the
    /// shared table.
    fn top_level_status(&self, _code: u32, _pending: &[PendingOperation]) -> Option<Verdict> {
        None
    }

    /// Resolve the claimed operations from a successful response.
    fn interpret_response(
        &self,
        cx: &mut ResponseContext<'_>,
        response: Option<&Document>,
    ) -> impl Future<Output = Result<Event>> + Send;
}

/// A command ready to run, as scheduled by a controller.
pub enum CommandKind {
    Options(Options),
    Provision(Provision),
    FolderCreate(FolderCreate),
    FolderUpdate(FolderUpdate),
    FolderDelete(FolderDelete),
    MoveItems(MoveItems),
    SyncUpload(SyncUpload),
    SendMail(SendMail),
    MeetingResponse(MeetingResponse),
    ItemOperations(ItemOperations),
    Search(Search),
    Ping(Ping),
    Wait(Wait),
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Options(c) => c.name(),
            CommandKind::Provision(c) => c.name(),
            CommandKind::FolderCreate(c) => c.name(),
            CommandKind::FolderUpdate(c) => c.name(),
            CommandKind::FolderDelete(c) => c.name(),
            CommandKind::MoveItems(c) => c.name(),
            CommandKind::SyncUpload(c) => c.name(),
            CommandKind::SendMail(c) => c.name(),
            CommandKind::MeetingResponse(c) => c.name(),
            CommandKind::ItemOperations(c) => c.name(),
            CommandKind::Search(c) => c.name(),
            CommandKind::Ping(c) => c.name(),
            CommandKind::Wait(_) => "Wait",
        }
    }

    /// The command's claimed operations; the local wait holds none.
    pub fn queue(&self) -> Option<&PendingQueue> {
        match self {
            CommandKind::Options(c) => Some(c.queue()),
            CommandKind::Provision(c) => Some(c.queue()),
            CommandKind::FolderCreate(c) => Some(c.queue()),
            CommandKind::FolderUpdate(c) => Some(c.queue()),
            CommandKind::FolderDelete(c) => Some(c.queue()),
            CommandKind::MoveItems(c) => Some(c.queue()),
            CommandKind::SyncUpload(c) => Some(c.queue()),
            CommandKind::SendMail(c) => Some(c.queue()),
            CommandKind::MeetingResponse(c) => Some(c.queue()),
            CommandKind::ItemOperations(c) => Some(c.queue()),
            CommandKind::Search(c) => Some(c.queue()),
            CommandKind::Ping(c) => Some(c.queue()),
            CommandKind::Wait(_) => None,
        }
    }

    /// Whether running it would do anything.
    pub async fn has_work(&self) -> bool {
        match self {
            CommandKind::Options(_)
            | CommandKind::Provision(_)
            | CommandKind::Ping(_)
            | CommandKind::Wait(_) => true,
            other => match other.queue() {
                Some(queue) => !queue.is_empty().await,
                None => false,
            },
        }
    }

    pub async fn execute(&self, executor: &Executor, cancel: &CancellationToken) -> Event {
        match self {
            CommandKind::Options(c) => executor.execute(c, cancel).await,
            CommandKind::Provision(c) => executor.execute(c, cancel).await,
            CommandKind::FolderCreate(c) => executor.execute(c, cancel).await,
            CommandKind::FolderUpdate(c) => executor.execute(c, cancel).await,
            CommandKind::FolderDelete(c) => executor.execute(c, cancel).await,
            CommandKind::MoveItems(c) => executor.execute(c, cancel).await,
            CommandKind::SyncUpload(c) => executor.execute(c, cancel).await,
            CommandKind::SendMail(c) => executor.execute(c, cancel).await,
            CommandKind::MeetingResponse(c) => executor.execute(c, cancel).await,
            CommandKind::ItemOperations(c) => executor.execute(c, cancel).await,
            CommandKind::Search(c) => executor.execute(c, cancel).await,
            CommandKind::Ping(c) => executor.execute(c, cancel).await,
            CommandKind::Wait(c) => c.run(cancel).await,
        }
    }

    /// Force every claimed operation back to Eligible unless a response is
    /// already being processed.
    pub async fn cancel(&self) -> Result<usize> {
        match self.queue() {
            Some(queue) => queue.cancel().await,
            None => Ok(0),
        }
    }
}
