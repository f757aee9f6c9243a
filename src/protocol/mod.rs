//! ActiveSync protocol vocabulary and plumbing.
//!
//! This module is split into:
//! - `event.rs` - Outcome events reported to the driving controller
//! - `status.rs` - Top-level status table and interpreter
//! - `state.rs` - Per-account protocol cursor and capabilities
//! - `document.rs` - Tree-structured request/response documents
//! - `codec.rs` - Document encoding on the wire
//! - `transport.rs` - Transport seam and wire request/response types
//! - `http.rs` - reqwest transport
//! - `wire.rs` - One exchange with bounded retry, timeout and cancellation

pub mod codec;
pub mod document;
mod event;
pub mod http;
mod state;
pub mod status;
pub mod transport;
pub mod wire;

pub use codec::{CodecError, DocumentCodec, JsonCodec};
pub use document::{Document, Element};
pub use event::{Event, EventKind};
pub use http::HttpTransport;
pub use state::{Capabilities, ProtocolState, StateEffect};
pub use status::{PendingAction, Verdict};
pub use transport::{Method, Transport, TransportError, WireRequest, WireResponse};
pub use wire::{WireError, WireOperation, WirePolicy};
