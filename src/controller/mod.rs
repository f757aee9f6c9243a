//! Per-account controllers and the engine that owns them.
//!
//! - `context.rs` - Shared context and policy handed to every controller
//! - `actor.rs` - The controller task for one account
//! - `manager.rs` - `Engine`, the entry point for callers queueing work

mod actor;
mod context;
mod manager;

pub use actor::{
    AccountSession, ControllerCommand, ControllerEvent, ControllerHandle, spawn_controller,
};
pub use context::{EngineContext, EnginePolicy};
pub use manager::Engine;
