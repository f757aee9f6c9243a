//! Top-level status interpretation.
//!
//! Every top-level status code the protocol documents maps to exactly one
//! outcome class through `TOP_LEVEL_STATUS`. Commands consult
//! `Command::top_level_status` first and fall back to `interpret`.

use std::ops::RangeInclusive;

use super::{Event, EventKind, StateEffect};
use crate::pending::{BlockReason, DeferUntil, Resolution, Why};

/// Documented top-level codes. Codes in `UNASSIGNED` are reserved.
pub const DOCUMENTED: RangeInclusive<u32> = 101..=177;
pub const UNASSIGNED: RangeInclusive<u32> = 157..=159;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeClass {
    HardFail,
    TempFail,
    UserBlocked,
    ControlReset,
    SuccessAdjacent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    HardFail(Why),
    TempFail,
    UserBlocked(BlockReason, Why),
    Reset(EventKind, Option<StateEffect>),
    SuccessAdjacent,
}

impl Mapping {
    pub fn class(self) -> OutcomeClass {
        match self {
            Mapping::HardFail(_) => OutcomeClass::HardFail,
            Mapping::TempFail => OutcomeClass::TempFail,
            Mapping::UserBlocked(..) => OutcomeClass::UserBlocked,
            Mapping::Reset(..) => OutcomeClass::ControlReset,
            Mapping::SuccessAdjacent => OutcomeClass::SuccessAdjacent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRule {
    pub code: u32,
    pub name: &'static str,
    pub mapping: Mapping,
}

/// What happens to the pending operations held by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Succeed,
    HardFail(Why),
    Defer(Why),
    ForceDefer,
    Block(BlockReason, Why),
}

impl PendingAction {
    pub fn resolution(self) -> Resolution {
        match self {
            PendingAction::Succeed => Resolution::Success,
            PendingAction::HardFail(why) => Resolution::HardFail(why),
            PendingAction::Defer(why) => Resolution::Deferred {
                why,
                until: DeferUntil::Anytime,
            },
            PendingAction::ForceDefer => Resolution::DeferredForce,
            PendingAction::Block(reason, why) => Resolution::UserBlocked(reason, why),
        }
    }
}

/// A complete decision for one response: resolution, event and cursor effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub code: u32,
    pub action: PendingAction,
    pub event: Event,
    pub effect: Option<StateEffect>,
}

impl Verdict {
    pub fn new(code: u32, action: PendingAction, event: Event) -> Self {
        Self {
            code,
            action,
            event,
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: StateEffect) -> Self {
        self.effect = Some(effect);
        self
    }
}

const fn hard(code: u32, name: &'static str, why: Why) -> StatusRule {
    StatusRule {
        code,
        name,
        mapping: Mapping::HardFail(why),
    }
}

const fn temp(code: u32, name: &'static str) -> StatusRule {
    StatusRule {
        code,
        name,
        mapping: Mapping::TempFail,
    }
}

const fn user(code: u32, name: &'static str, why: Why) -> StatusRule {
    StatusRule {
        code,
        name,
        mapping: Mapping::UserBlocked(BlockReason::UserRemediation, why),
    }
}

const fn admin(code: u32, name: &'static str, why: Why) -> StatusRule {
    StatusRule {
        code,
        name,
        mapping: Mapping::UserBlocked(BlockReason::AdminRemediation, why),
    }
}

const fn reset(
    code: u32,
    name: &'static str,
    kind: EventKind,
    effect: Option<StateEffect>,
) -> StatusRule {
    StatusRule {
        code,
        name,
        mapping: Mapping::Reset(kind, effect),
    }
}

/// Sorted by code.
pub static TOP_LEVEL_STATUS: &[StatusRule] = &[
    hard(101, "InvalidContent", Why::BadOrMalformed),
    hard(102, "InvalidWBXML", Why::BadOrMalformed),
    hard(103, "InvalidXML", Why::BadOrMalformed),
    hard(104, "InvalidDateTime", Why::BadOrMalformed),
    hard(105, "InvalidCombinationOfIDs", Why::BadOrMalformed),
    hard(106, "InvalidIDs", Why::BadOrMalformed),
    hard(107, "InvalidMIME", Why::BadOrMalformed),
    hard(108, "DeviceIdMissingOrInvalid", Why::BadOrMalformed),
    hard(109, "DeviceTypeMissingOrInvalid", Why::BadOrMalformed),
    hard(110, "ServerError", Why::ServerError),
    temp(111, "ServerErrorRetryLater"),
    hard(112, "ActiveDirectoryAccessDenied", Why::AccessDeniedOrBlocked),
    user(113, "MailboxQuotaExceeded", Why::NoSpace),
    admin(114, "MailboxServerOffline", Why::ServerOffline),
    admin(115, "SendQuotaExceeded", Why::QuotaExceeded),
    user(116, "MessageRecipientUnresolved", Why::UnresolvedRecipient),
    hard(117, "MessageReplyNotAllowed", Why::ReplyNotAllowed),
    StatusRule {
        code: 118,
        name: "MessagePreviouslySent",
        mapping: Mapping::SuccessAdjacent,
    },
    user(119, "MessageHasNoRecipient", Why::NoRecipient),
    hard(120, "MailSubmissionFailed", Why::ServerError),
    hard(121, "MessageReplyFailed", Why::ServerError),
    user(122, "AttachmentIsTooLarge", Why::TooBig),
    hard(123, "UserHasNoMailbox", Why::MissingOnServer),
    hard(124, "UserCannotBeAnonymous", Why::ProtocolError),
    hard(125, "UserPrincipalCouldNotBeFound", Why::ProtocolError),
    hard(126, "UserDisabledForSync", Why::AccessDeniedOrBlocked),
    hard(127, "UserOnNewMailboxCannotSync", Why::ServerError),
    hard(128, "UserOnLegacyMailboxCannotSync", Why::ServerError),
    hard(129, "DeviceIsBlockedForThisUser", Why::AccessDeniedOrBlocked),
    hard(130, "AccessDenied", Why::AccessDeniedOrBlocked),
    hard(131, "AccountDisabled", Why::AccessDeniedOrBlocked),
    reset(132, "SyncStateNotFound", EventKind::ReSync, None),
    reset(133, "SyncStateLocked", EventKind::ReSync, None),
    reset(134, "SyncStateCorrupt", EventKind::ReSync, None),
    reset(135, "SyncStateAlreadyExists", EventKind::ReSync, None),
    reset(136, "SyncStateVersionInvalid", EventKind::ReSync, None),
    hard(137, "CommandNotSupported", Why::ProtocolError),
    hard(138, "VersionNotSupported", Why::ProtocolError),
    hard(139, "DeviceNotFullyProvisionable", Why::ProtocolError),
    reset(
        140,
        "RemoteWipeRequested",
        EventKind::ReProvision,
        Some(StateEffect::MarkWipeRequired),
    ),
    admin(141, "LegacyDeviceOnStrictPolicy", Why::AccessDeniedOrBlocked),
    reset(142, "DeviceNotProvisioned", EventKind::ReProvision, None),
    reset(143, "PolicyRefresh", EventKind::ReProvision, None),
    reset(
        144,
        "InvalidPolicyKey",
        EventKind::ReProvision,
        Some(StateEffect::ResetPolicyKey),
    ),
    hard(145, "ExternallyManagedDevicesNotAllowed", Why::ProtocolError),
    hard(146, "NoRecurrenceInCalendar", Why::ProtocolError),
    hard(147, "UnexpectedItemClass", Why::ProtocolError),
    admin(148, "RemoteServerHasNoSSL", Why::ServerOffline),
    hard(149, "InvalidStoredRequest", Why::ProtocolError),
    user(150, "ItemNotFound", Why::BadOrMalformed),
    user(151, "TooManyFolders", Why::BeyondRange),
    admin(152, "NoFoldersFound", Why::MissingOnServer),
    admin(153, "ItemsLostAfterMove", Why::MissingOnServer),
    hard(154, "FailureInMoveOperation", Why::ServerError),
    hard(155, "MoveCommandDisallowedForNonPersistentMoveAction", Why::ProtocolError),
    hard(156, "MoveCommandInvalidDestinationFolder", Why::ProtocolError),
    user(160, "AvailabilityTooManyRecipients", Why::BadOrMalformed),
    user(161, "AvailabilityDLLimitReached", Why::BadOrMalformed),
    temp(162, "AvailabilityTransientFailure"),
    hard(163, "AvailabilityFailure", Why::ServerError),
    hard(164, "BodyPartPreferenceTypeNotSupported", Why::ProtocolError),
    hard(165, "DeviceInformationRequired", Why::ProtocolError),
    hard(166, "InvalidAccountId", Why::ProtocolError),
    admin(167, "AccountSendDisabled", Why::AccessDeniedOrBlocked),
    admin(168, "IRMFeatureDisabled", Why::AccessDeniedOrBlocked),
    temp(169, "IRMTransientError"),
    hard(170, "IRMPermanentError", Why::ServerError),
    hard(171, "IRMInvalidTemplateID", Why::ProtocolError),
    hard(172, "IRMOperationNotPermitted", Why::ProtocolError),
    hard(173, "NoPicture", Why::MissingOnServer),
    user(174, "PictureTooLarge", Why::TooBig),
    user(175, "PictureLimitReached", Why::QuotaExceeded),
    hard(176, "BodyPartConversationTooLarge", Why::ProtocolError),
    admin(177, "MaximumDevicesReached", Why::QuotaExceeded),
];

pub fn is_documented(code: u32) -> bool {
    DOCUMENTED.contains(&code) && !UNASSIGNED.contains(&code)
}

pub fn lookup(code: u32) -> Option<&'static StatusRule> {
    TOP_LEVEL_STATUS
        .binary_search_by_key(&code, |rule| rule.code)
        .ok()
        .map(|index| &TOP_LEVEL_STATUS[index])
}

/// Map a top-level status code to a verdict. Returns None for codes outside
/// the top-level space (command-specific codes are below 101).
pub fn interpret(code: u32) -> Option<Verdict> {
    let rule = lookup(code)?;
    let mnemonic = format!("TLS{}", code);

    let verdict = match rule.mapping {
        Mapping::HardFail(why) => Verdict::new(
            code,
            PendingAction::HardFail(why),
            Event::hard_fail(mnemonic),
        ),
        Mapping::TempFail => Verdict::new(
            code,
            PendingAction::Defer(Why::ServerError),
            Event::temp_fail(mnemonic),
        ),
        Mapping::UserBlocked(reason, why) => Verdict::new(
            code,
            PendingAction::Block(reason, why),
            Event::hard_fail(mnemonic),
        ),
        Mapping::Reset(kind, effect) => Verdict {
            code,
            action: PendingAction::ForceDefer,
            event: Event::new(kind, mnemonic),
            effect,
        },
        Mapping::SuccessAdjacent => {
            Verdict::new(code, PendingAction::Succeed, Event::success(mnemonic))
        }
    };

    Some(verdict.with_message_from(rule))
}

impl Verdict {
    fn with_message_from(mut self, rule: &StatusRule) -> Self {
        self.event = self.event.with_message(rule.name);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_is_sorted_and_unique() {
        for pair in TOP_LEVEL_STATUS.windows(2) {
            assert!(pair[0].code < pair[1].code, "{} before {}", pair[0].code, pair[1].code);
        }
    }

    #[test]
    fn test_table_is_total_over_documented_codes() {
        let covered: HashSet<u32> = TOP_LEVEL_STATUS.iter().map(|rule| rule.code).collect();
        for code in DOCUMENTED {
            assert_eq!(
                covered.contains(&code),
                is_documented(code),
                "code {} coverage mismatch",
                code
            );
        }
        assert!(TOP_LEVEL_STATUS.iter().all(|rule| is_documented(rule.code)));
    }

    #[test]
    fn test_every_documented_code_has_one_verdict() {
        for code in DOCUMENTED.filter(|c| is_documented(*c)) {
            let verdict = interpret(code).expect("documented code must map");
            assert_eq!(verdict.code, code);
            assert_eq!(verdict.event.mnemonic, format!("TLS{}", code));
        }
    }

    #[test]
    fn test_codes_outside_table_fall_through_to_command() {
        assert!(interpret(1).is_none());
        assert!(interpret(100).is_none());
        assert!(interpret(158).is_none());
        assert!(interpret(178).is_none());
    }

    #[test]
    fn test_every_class_is_used() {
        let classes: HashSet<OutcomeClass> =
            TOP_LEVEL_STATUS.iter().map(|rule| rule.mapping.class()).collect();
        assert_eq!(classes.len(), 5);
    }

    #[test]
    fn test_message_previously_sent_is_success() {
        let verdict = interpret(118).unwrap();
        assert_eq!(verdict.action, PendingAction::Succeed);
        assert_eq!(verdict.event.kind, EventKind::Success);
    }

    #[test]
    fn test_sync_state_codes_force_defer_and_resync() {
        for code in 132..=136 {
            let verdict = interpret(code).unwrap();
            assert_eq!(verdict.action, PendingAction::ForceDefer);
            assert_eq!(verdict.event.kind, EventKind::ReSync);
        }
    }

    #[test]
    fn test_policy_codes_carry_state_effects() {
        assert_eq!(interpret(144).unwrap().effect, Some(StateEffect::ResetPolicyKey));
        assert_eq!(interpret(140).unwrap().effect, Some(StateEffect::MarkWipeRequired));
        assert_eq!(interpret(142).unwrap().event.kind, EventKind::ReProvision);
    }

    #[test]
    fn test_user_blocked_stops_from_user_perspective() {
        let verdict = interpret(113).unwrap();
        assert_eq!(
            verdict.action,
            PendingAction::Block(BlockReason::UserRemediation, Why::NoSpace)
        );
        assert_eq!(verdict.event.kind, EventKind::HardFail);
    }

    #[test]
    fn test_temp_fail_defers() {
        let verdict = interpret(111).unwrap();
        assert_eq!(verdict.action, PendingAction::Defer(Why::ServerError));
        assert_eq!(verdict.event.kind, EventKind::TempFail);
    }
}
