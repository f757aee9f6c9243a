//! Provision: acquires a policy key and detects remote wipe requests.

use anyhow::Result;

use super::{BuildError, Command, ResponseContext};
use crate::constants::POLICY_TYPE;
use crate::notification::OutcomeSummary;
use crate::pending::{PendingOperation, PendingQueue, Resolver};
use crate::protocol::document::{Element, ns};
use crate::protocol::{Document, Event, EventKind, PendingAction, ProtocolState, Verdict};

/// Provision holds no pending operations.
pub struct Provision {
    queue: PendingQueue,
}

impl Provision {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            queue: PendingQueue::empty(resolver),
        }
    }
}

impl Command for Provision {
    fn name(&self) -> &'static str {
        "Provision"
    }

    fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn requires_pending(&self) -> bool {
        false
    }

    fn sends_policy_key(&self) -> bool {
        false
    }

    fn build_request(
        &self,
        _state: &ProtocolState,
        _pending: &[PendingOperation],
    ) -> Result<Option<Document>, BuildError> {
        Ok(Some(Document::new(
            Element::new(ns::PROVISION, "Provision").with(
                Element::new(ns::PROVISION, "Policies").with(
                    Element::new(ns::PROVISION, "Policy")
                        .with_leaf(ns::PROVISION, "PolicyType", POLICY_TYPE),
                ),
            ),
        )))
    }

    /// A provisioning status from Provision itself would only ask for
    /// another Provision.
    fn top_level_status(&self, code: u32, _pending: &[PendingOperation]) -> Option<Verdict> {
        (142..=144).contains(&code).then(|| {
            Verdict::new(
                code,
                PendingAction::ForceDefer,
                Event::hard_fail("PROVLOOP").with_message(format!("status {}", code)),
            )
        })
    }

    async fn interpret_response(
        &self,
        cx: &mut ResponseContext<'_>,
        response: Option<&Document>,
    ) -> Result<Event> {
        let Some(document) = response else {
            return Ok(Event::hard_fail("PVNOBODY"));
        };

        match document.status()? {
            Some(1) | None => {}
            Some(2) => return Ok(Event::hard_fail("PVPROTOCOL")),
            Some(3) => return Ok(Event::temp_fail("PVSERVERERR")),
            Some(code) => return Ok(Event::hard_fail(format!("PVSTATUS{}", code))),
        }

        if document.root.child("RemoteWipe").is_some() {
            tracing::warn!("[account {}] Server requested a remote wipe", cx.account_id);
            cx.state.wipe_required = true;
            cx.sink.notify(cx.account_id, OutcomeSummary::WipeRequested);
            return Ok(Event::new(EventKind::Wipe, "PVWIPE"));
        }

        let Some(policy) = document
            .root
            .child("Policies")
            .and_then(|p| p.child("Policy"))
        else {
            return Ok(Event::hard_fail("PVNOPOLICY"));
        };

        match policy.child_u32("Status")?.unwrap_or(0) {
            1 => match policy.child_text("PolicyKey") {
                Some(key) => {
                    cx.state.policy_key = key.to_string();
                    tracing::info!("[account {}] Provisioned", cx.account_id);
                    Ok(Event::success("PVSUCCESS"))
                }
                None => Ok(Event::hard_fail("PVNOKEY")),
            },
            // 2 no policy for this client, 3 unknown type, 4 corrupt, 5 key mismatch
            code => Ok(Event::hard_fail(format!("PVPOLICY{}", code))),
        }
    }
}
