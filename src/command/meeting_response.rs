//! MeetingResponse: accept, tentatively accept or decline an invitation.

use anyhow::Result;

use super::{BuildError, Command, ResponseContext};
use crate::pending::{
    AccountId, DeferUntil, Operation, PendingOperation, PendingQueue, Resolution, Resolver,
    StatusKind, Why,
};
use crate::protocol::document::{Element, ns};
use crate::protocol::{Document, Event, ProtocolState};

pub struct MeetingResponse {
    queue: PendingQueue,
}

impl MeetingResponse {
    pub async fn claim(resolver: Resolver, account_id: AccountId) -> Result<Self> {
        Ok(Self {
            queue: PendingQueue::claim_single(resolver, account_id, &[Operation::MeetingResponse])
                .await?,
        })
    }
}

impl Command for MeetingResponse {
    fn name(&self) -> &'static str {
        "MeetingResponse"
    }

    fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn build_request(
        &self,
        _state: &ProtocolState,
        pending: &[PendingOperation],
    ) -> Result<Option<Document>, BuildError> {
        let Some(op) = pending.first() else {
            return Ok(None);
        };
        let response = op.response.ok_or_else(|| BuildError::missing(op, "user response"))?;
        if !(1..=3).contains(&response) {
            return Err(BuildError::InvalidPayload(format!(
                "meeting response {} is not accept, tentative or decline",
                response
            )));
        }
        let request_id = op
            .server_id
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "request id"))?;
        let collection = op
            .parent_id
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "collection id"))?;

        Ok(Some(Document::new(
            Element::new(ns::MEETING_RESPONSE, "MeetingResponse").with(
                Element::new(ns::MEETING_RESPONSE, "Request")
                    .with_leaf(ns::MEETING_RESPONSE, "UserResponse", response.to_string())
                    .with_leaf(ns::MEETING_RESPONSE, "CollectionId", collection)
                    .with_leaf(ns::MEETING_RESPONSE, "RequestId", request_id),
            ),
        )))
    }

    async fn interpret_response(
        &self,
        _cx: &mut ResponseContext<'_>,
        response: Option<&Document>,
    ) -> Result<Event> {
        let Some(result) = response.and_then(|d| d.root.child("Result")) else {
            self.queue
                .resolve_each(Resolution::HardFail(Why::ProtocolError))
                .await?;
            return Ok(Event::hard_fail("MRNORESULT"));
        };

        let status = result.child_u32("Status")?.unwrap_or(0);
        self.queue
            .record_status(status, StatusKind::CommandSpecific)
            .await;

        let (resolution, event) = match status {
            1 => {
                if let Some(calendar_id) = result.child_text("CalendarId") {
                    tracing::debug!("Meeting response placed calendar item {}", calendar_id);
                }
                (Resolution::Success, Event::success("MRSUCCESS"))
            }
            2 => (
                Resolution::HardFail(Why::BadOrMalformed),
                Event::hard_fail("MRBADREQUEST"),
            ),
            3 | 4 => (
                Resolution::Deferred {
                    why: Why::ServerError,
                    until: DeferUntil::Anytime,
                },
                Event::temp_fail(if status == 3 { "MRMAILBOXERR" } else { "MRSERVERERR" }),
            ),
            code => (
                Resolution::HardFail(Why::Unknown),
                Event::hard_fail(format!("MRSTATUS{}", code)),
            ),
        };

        self.queue.resolve_each(resolution).await?;
        Ok(event)
    }
}
