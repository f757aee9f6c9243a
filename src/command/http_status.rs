//! HTTP status classification, ahead of any document-level status.

use crate::constants::CONSECUTIVE_401_BEFORE_REDISCOVER;
use crate::pending::Why;
use crate::protocol::{Event, EventKind, PendingAction, ProtocolState, StateEffect, Verdict};

/// Map a non-success HTTP status to a verdict. Returns None for 2xx.
pub fn classify(status: u16, state: &ProtocolState) -> Option<Verdict> {
    let code = u32::from(status);
    let mnemonic = format!("HTTP{}", status);
    let hard = |why| Verdict::new(code, PendingAction::HardFail(why), Event::hard_fail(&mnemonic));
    let force = |kind| Verdict::new(code, PendingAction::ForceDefer, Event::new(kind, &mnemonic));
    // Each retry spends one of the operation's defers.
    let spend = |why| Verdict::new(code, PendingAction::Defer(why), Event::hard_fail(&mnemonic));

    let verdict = match status {
        200..=299 => return None,
        400 => hard(Why::ProtocolError),
        401 => {
            let kind = if state.consecutive_401 + 1 >= CONSECUTIVE_401_BEFORE_REDISCOVER {
                EventKind::ReDiscover
            } else {
                EventKind::AuthFail
            };
            force(kind).with_effect(StateEffect::CountAuthFailure)
        }
        403 => Verdict::new(
            code,
            PendingAction::HardFail(Why::AccessDeniedOrBlocked),
            Event::new(EventKind::ReDiscover, &mnemonic),
        ),
        404 => hard(Why::MissingOnServer),
        449 => force(EventKind::ReProvision),
        302 | 451 => force(EventKind::ReDiscover),
        456 | 457 | 501 => spend(Why::ProtocolError),
        500 => Verdict::new(
            code,
            PendingAction::HardFail(Why::ServerError),
            Event::new(EventKind::ReDiscover, &mnemonic),
        ),
        507 => hard(Why::NoSpace),
        _ => hard(Why::Unknown),
    };

    Some(verdict)
}
