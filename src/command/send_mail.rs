//! SendMail: submits one outgoing message.

use anyhow::Result;

use super::{BuildError, Command, ResponseContext};
use crate::pending::{AccountId, Operation, PendingOperation, PendingQueue, Resolution, Resolver, Why};
use crate::protocol::document::{Element, ns};
use crate::protocol::{Document, Event, ProtocolState};

pub struct SendMail {
    queue: PendingQueue,
}

impl SendMail {
    pub async fn claim(resolver: Resolver, account_id: AccountId) -> Result<Self> {
        Ok(Self {
            queue: PendingQueue::claim_single(resolver, account_id, &[Operation::EmailSend])
                .await?,
        })
    }
}

impl Command for SendMail {
    fn name(&self) -> &'static str {
        "SendMail"
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
        let mime = op
            .payload
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "message body"))?;

        // The token doubles as ClientId so the server can drop a resubmission.
        Ok(Some(Document::new(
            Element::new(ns::COMPOSE_MAIL, "SendMail")
                .with_leaf(ns::COMPOSE_MAIL, "ClientId", &op.token)
                .with(Element::new(ns::COMPOSE_MAIL, "SaveInSentItems"))
                .with_leaf(ns::COMPOSE_MAIL, "Mime", mime),
        )))
    }

    async fn interpret_response(
        &self,
        _cx: &mut ResponseContext<'_>,
        response: Option<&Document>,
    ) -> Result<Event> {
        // An empty 200 is the protocol's success.
        let Some(document) = response else {
            self.queue.resolve_each(Resolution::Success).await?;
            return Ok(Event::success("SMSUCCESS"));
        };

        match document.status()? {
            None | Some(1) => {
                self.queue.resolve_each(Resolution::Success).await?;
                Ok(Event::success("SMSUCCESS"))
            }
            Some(code) => {
                self.queue.resolve_each(Resolution::HardFail(Why::Unknown)).await?;
                Ok(Event::hard_fail(format!("SMSTATUS{}", code)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventKind, WireResponse};
    use crate::testing::{Harness, json_response};
    use tokio_util::sync::CancellationToken;

    async fn queue_send(harness: &Harness) -> PendingOperation {
        let mut send = PendingOperation::new(1, Operation::EmailSend).with_payload("Subject: hi\r\n\r\nbody");
        harness.cx.store.insert_pending(&mut send).await.unwrap();
        send
    }

    #[tokio::test]
    async fn test_empty_response_is_success() {
        let harness = Harness::new().await;
        let send = queue_send(&harness).await;
        harness.transport.push_response(WireResponse::new(200));

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.kind, EventKind::Success);
        assert!(harness.cx.store.get_pending(send.id).await.unwrap().unwrap().succeeded());

        let request = harness.transport.request_document(0);
        assert_eq!(request.root.child_text("ClientId"), Some(send.token.as_str()));
        assert!(request.root.child("SaveInSentItems").is_some());
    }

    #[tokio::test]
    async fn test_already_sent_counts_as_success() {
        let harness = Harness::new().await;
        let send = queue_send(&harness).await;
        let body = Document::new(
            Element::new(ns::COMPOSE_MAIL, "SendMail").with_leaf(ns::COMPOSE_MAIL, "Status", "118"),
        );
        harness.transport.push_response(json_response(&body));

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.kind, EventKind::Success);
        assert!(harness.cx.store.get_pending(send.id).await.unwrap().unwrap().succeeded());
    }
}
