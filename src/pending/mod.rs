//! Pending operations: durable records of queued local mutations.
//!
//! This module is split into:
//! - `mod.rs` - The `PendingOperation` record and its vocabulary enums
//! - `resolve.rs` - Resolution rules, predecessor bookkeeping and claiming
//! - `queue.rs` - The per-command queue with claim-vs-cancel discipline

mod queue;
mod resolve;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use crate::constants::PLACEHOLDER_PREFIX;

pub use queue::PendingQueue;
pub use resolve::{Resolution, Resolver};

pub type PendingId = i64;
pub type AccountId = i64;

/// Error returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a fieldless enum stored as text, with `as_str`, `FromStr` and `Display`.
macro_rules! stored_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

stored_enum! {
    /// The kind of mutation a pending operation asks the server to perform.
    pub enum Operation {
        FolderCreate => "folder_create",
        FolderDelete => "folder_delete",
        FolderUpdate => "folder_update",
        EmailSend => "email_send",
        EmailMove => "email_move",
        CalCreate => "cal_create",
        CalMove => "cal_move",
        ContactMove => "contact_move",
        TaskMove => "task_move",
        ContactSearch => "contact_search",
        AttachmentDownload => "attachment_download",
        MeetingResponse => "meeting_response",
    }
}

impl Operation {
    /// Name of the server-side cursor this operation advances, if any.
    /// At most one operation per account and resource may be Dispatched.
    pub fn serialized_resource(self) -> Option<&'static str> {
        match self {
            Operation::FolderCreate | Operation::FolderDelete | Operation::FolderUpdate => {
                Some("folder-hierarchy")
            }
            _ => None,
        }
    }

    /// Operations sharing this one's serialized resource.
    pub fn sharing_resource(self) -> Vec<Operation> {
        match self.serialized_resource() {
            Some(resource) => Operation::ALL
                .iter()
                .copied()
                .filter(|op| op.serialized_resource() == Some(resource))
                .collect(),
            None => Vec::new(),
        }
    }
}

stored_enum! {
    /// Lifecycle state of a pending operation.
    pub enum State {
        Eligible => "eligible",
        Dispatched => "dispatched",
        Deferred => "deferred",
        PredecessorBlocked => "predecessor_blocked",
        UserBlocked => "user_blocked",
        Failed => "failed",
        Deleted => "deleted",
    }
}

stored_enum! {
    /// Why a pending operation is parked until the user or an admin acts.
    pub enum BlockReason {
        UserRemediation => "user_remediation",
        AdminRemediation => "admin_remediation",
        MustChangeName => "must_change_name",
        MustPickNewParent => "must_pick_new_parent",
    }
}

stored_enum! {
    /// Diagnostic reason attached to a failed, blocked or deferred operation.
    pub enum Why {
        Unknown => "unknown",
        BadOrMalformed => "bad_or_malformed",
        ServerError => "server_error",
        AccessDeniedOrBlocked => "access_denied_or_blocked",
        NoSpace => "no_space",
        ServerOffline => "server_offline",
        QuotaExceeded => "quota_exceeded",
        UnresolvedRecipient => "unresolved_recipient",
        ReplyNotAllowed => "reply_not_allowed",
        NoRecipient => "no_recipient",
        MissingOnServer => "missing_on_server",
        ProtocolError => "protocol_error",
        BeyondRange => "beyond_range",
        TooBig => "too_big",
        LockedOnServer => "locked_on_server",
        ConflictWithServer => "conflict_with_server",
        SpecialFolder => "special_folder",
        AlreadyExists => "already_exists",
        PredecessorFailed => "predecessor_failed",
        CancelledByUser => "cancelled_by_user",
    }
}

stored_enum! {
    /// Where the last recorded status code came from.
    pub enum StatusKind {
        TopLevel => "top_level",
        CommandSpecific => "command_specific",
    }
}

/// Condition that returns a Deferred operation to Eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferUntil {
    /// Next scheduling pass.
    Anytime,
    /// After the folder hierarchy has been resynchronized.
    FolderSync,
    /// After item synchronization has run.
    Sync,
    /// Not before the given instant.
    Time(DateTime<Utc>),
}

impl DeferUntil {
    pub(crate) fn to_columns(self) -> (&'static str, Option<i64>) {
        match self {
            DeferUntil::Anytime => ("anytime", None),
            DeferUntil::FolderSync => ("folder_sync", None),
            DeferUntil::Sync => ("sync", None),
            DeferUntil::Time(at) => ("time", Some(at.timestamp())),
        }
    }

    pub(crate) fn from_columns(kind: &str, deadline: Option<i64>) -> Result<Self, UnknownVariant> {
        match kind {
            "anytime" => Ok(DeferUntil::Anytime),
            "folder_sync" => Ok(DeferUntil::FolderSync),
            "sync" => Ok(DeferUntil::Sync),
            "time" => Ok(DeferUntil::Time(
                deadline
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                    .unwrap_or_else(Utc::now),
            )),
            other => Err(UnknownVariant {
                kind: "DeferUntil",
                value: other.to_string(),
            }),
        }
    }
}

/// A durable record of one queued local mutation awaiting server confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: PendingId,
    pub account_id: AccountId,
    /// Stable idempotency token, used to cancel from outside the engine.
    pub token: String,
    pub operation: Operation,
    pub state: State,
    /// Remote identity of the target object; may be a placeholder.
    pub server_id: Option<String>,
    pub parent_id: Option<String>,
    pub dest_parent_id: Option<String>,
    pub display_name: Option<String>,
    pub folder_type: Option<u32>,
    /// Opaque operation payload (MIME reference, search query, item data).
    pub payload: Option<String>,
    /// Meeting response choice: 1 accept, 2 tentative, 3 decline.
    pub response: Option<u32>,
    pub predecessor_id: Option<PendingId>,
    pub defers_remaining: u32,
    pub defer_until: Option<DeferUntil>,
    pub block_reason: Option<BlockReason>,
    pub why: Option<Why>,
    pub last_status: Option<u32>,
    pub last_status_kind: Option<StatusKind>,
    pub created_at: DateTime<Utc>,
}

impl PendingOperation {
    /// A fresh Eligible operation. The store assigns id and token on insert.
    pub fn new(account_id: AccountId, operation: Operation) -> Self {
        Self {
            id: 0,
            account_id,
            token: String::new(),
            operation,
            state: State::Eligible,
            server_id: None,
            parent_id: None,
            dest_parent_id: None,
            display_name: None,
            folder_type: None,
            payload: None,
            response: None,
            predecessor_id: None,
            defers_remaining: 0,
            defer_until: None,
            block_reason: None,
            why: None,
            last_status: None,
            last_status_kind: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_dest_parent(mut self, dest_parent_id: impl Into<String>) -> Self {
        self.dest_parent_id = Some(dest_parent_id.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_folder_type(mut self, folder_type: u32) -> Self {
        self.folder_type = Some(folder_type);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_response(mut self, response: u32) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_defers(mut self, defers: u32) -> Self {
        self.defers_remaining = defers;
        self
    }

    /// Block this operation until `predecessor` resolves.
    pub fn after(mut self, predecessor: PendingId) -> Self {
        self.predecessor_id = Some(predecessor);
        self
    }

    /// Resolved as a success. Successful operations are kept as Deleted with no reason.
    pub fn succeeded(&self) -> bool {
        self.state == State::Deleted && self.why.is_none()
    }

    /// Resolved without success: failed outright, or deleted for a reason.
    pub fn failed(&self) -> bool {
        self.state == State::Failed || (self.state == State::Deleted && self.why.is_some())
    }

    /// No further resolution will ever apply.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Failed | State::Deleted)
    }

    pub fn record_status(&mut self, code: u32, kind: StatusKind) {
        self.last_status = Some(code);
        self.last_status_kind = Some(kind);
    }
}

/// Random hex string from the OS RNG.
fn random_hex(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    getrandom::fill(&mut bytes)
        .map_err(|e| anyhow::anyhow!("Failed to generate random bytes: {}", e))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// New idempotency token for a pending operation.
pub fn new_token() -> Result<String> {
    random_hex(16)
}

/// New placeholder server id for an object the server has not yet created.
pub fn new_placeholder() -> Result<String> {
    Ok(format!("{}{}", PLACEHOLDER_PREFIX, random_hex(12)?))
}

pub fn is_placeholder(server_id: &str) -> bool {
    server_id.starts_with(PLACEHOLDER_PREFIX)
}
