//! Outcome events consumed by the driving controller.

use std::fmt;

/// Control vocabulary a command reports back to its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Success,
    TempFail,
    HardFail,
    ReSync,
    ReFolderSync,
    ReProvision,
    ReDiscover,
    AuthFail,
    Wipe,
}

impl EventKind {
    /// Signals a stale client cursor rather than an outcome of the operation.
    pub fn is_control(self) -> bool {
        !matches!(
            self,
            EventKind::Success | EventKind::TempFail | EventKind::HardFail
        )
    }
}

/// Transient outcome of one command, with a short diagnostic mnemonic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub mnemonic: String,
    pub message: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, mnemonic: impl Into<String>) -> Self {
        Self {
            kind,
            mnemonic: mnemonic.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn success(mnemonic: impl Into<String>) -> Self {
        Self::new(EventKind::Success, mnemonic)
    }

    pub fn temp_fail(mnemonic: impl Into<String>) -> Self {
        Self::new(EventKind::TempFail, mnemonic)
    }

    pub fn hard_fail(mnemonic: impl Into<String>) -> Self {
        Self::new(EventKind::HardFail, mnemonic)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.mnemonic)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}
