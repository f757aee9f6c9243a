//! ActiveSync protocol engine.
//!
//! Turns locally queued mutations (send mail, move an item, create a folder,
//! respond to a meeting) into request/response exchanges with an ActiveSync
//! server, interprets the server's status codes, and resolves each queued
//! operation as done, retried, deferred, escalated to the user, or as a
//! signal that a wider client cursor must be reset.
//!
//! - `pending` - Pending operations, their resolution rules and the per-command queue
//! - `protocol` - Status interpretation, events, documents, transport and wire retries
//! - `command` - The command family and the shared executor
//! - `controller` - Per-account driving controller and the multi-account engine
//! - `store` - SQLite persistence for pending operations, protocol state and local mirrors

pub mod command;
pub mod config;
pub mod constants;
pub mod controller;
pub mod credentials;
pub mod notification;
pub mod pending;
pub mod protocol;
pub mod retry;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use command::Executor;
pub use controller::{AccountSession, ControllerEvent, Engine, EngineContext, EnginePolicy};
pub use notification::{NotificationSink, OutcomeSummary};
pub use pending::{Operation, PendingOperation, PendingQueue, Resolution, State};
pub use protocol::{Event, EventKind};
pub use store::Store;
