//! MoveItems: batches item moves across every item class.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};

use super::{BuildError, Command, ResponseContext};
use crate::constants::LOCKED_ITEM_RETRY_SECS;
use crate::pending::{
    AccountId, DeferUntil, Operation, PendingOperation, PendingQueue, Resolution, Resolver,
    StatusKind, Why, is_placeholder,
};
use crate::protocol::document::{Element, ns};
use crate::protocol::{Document, Event, EventKind, ProtocolState};

pub const MOVE_OPERATIONS: &[Operation] = &[
    Operation::EmailMove,
    Operation::CalMove,
    Operation::ContactMove,
    Operation::TaskMove,
];

pub struct MoveItems {
    queue: PendingQueue,
}

impl MoveItems {
    pub async fn claim(resolver: Resolver, account_id: AccountId, batch: usize) -> Result<Self> {
        Ok(Self {
            queue: PendingQueue::claim_list(resolver, account_id, MOVE_OPERATIONS, batch).await?,
        })
    }
}

/// Escalation order of the per-item events folded into one.
fn rank(kind: EventKind) -> u8 {
    match kind {
        EventKind::ReFolderSync => 3,
        EventKind::ReSync => 2,
        EventKind::HardFail => 1,
        _ => 0,
    }
}

fn field<'a>(op: &'a PendingOperation, value: &'a Option<String>, name: &'static str) -> Result<&'a str, BuildError> {
    let value = value.as_deref().ok_or_else(|| BuildError::missing(op, name))?;
    if is_placeholder(value) {
        return Err(BuildError::UnresolvedPlaceholder(name));
    }
    Ok(value)
}

impl Command for MoveItems {
    fn name(&self) -> &'static str {
        "MoveItems"
    }

    fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn build_request(
        &self,
        _state: &ProtocolState,
        pending: &[PendingOperation],
    ) -> Result<Option<Document>, BuildError> {
        let mut root = Element::new(ns::MOVE, "MoveItems");
        for op in pending {
            root = root.with(
                Element::new(ns::MOVE, "Move")
                    .with_leaf(ns::MOVE, "SrcMsgId", field(op, &op.server_id, "SrcMsgId")?)
                    .with_leaf(ns::MOVE, "SrcFldId", field(op, &op.parent_id, "SrcFldId")?)
                    .with_leaf(ns::MOVE, "DstFldId", field(op, &op.dest_parent_id, "DstFldId")?),
            );
        }
        Ok(Some(Document::new(root)))
    }

    async fn interpret_response(
        &self,
        cx: &mut ResponseContext<'_>,
        response: Option<&Document>,
    ) -> Result<Event> {
        let Some(document) = response else {
            self.queue
                .resolve_each(Resolution::HardFail(Why::ProtocolError))
                .await?;
            return Ok(Event::hard_fail("MVNOBODY"));
        };

        let held = self.queue.snapshot().await;
        let mut event = Event::success("MVSUCCESS");

        for item in document.root.children_named("Response") {
            let Some(src) = item.child_text("SrcMsgId") else {
                tracing::warn!("MoveItems response without SrcMsgId");
                continue;
            };
            let Some(pending) = held.iter().find(|p| p.server_id.as_deref() == Some(src)) else {
                tracing::warn!("MoveItems response for unrequested item {}", src);
                continue;
            };
            let status = item.child_u32("Status")?.unwrap_or(0);
            self.queue
                .record_status_of(pending.id, status, StatusKind::CommandSpecific)
                .await;

            let (resolution, item_event) = match status {
                1 | 2 => (
                    Resolution::Deferred {
                        why: Why::MissingOnServer,
                        until: DeferUntil::FolderSync,
                    },
                    Event::new(
                        EventKind::ReFolderSync,
                        if status == 1 { "MVBADSRC" } else { "MVBADDST" },
                    ),
                ),
                3 => {
                    let dest = pending.dest_parent_id.as_deref().unwrap_or_default();
                    cx.store.move_item(cx.account_id, src, dest).await?;
                    if let Some(new_id) = item.child_text("DstMsgId").filter(|id| *id != src) {
                        cx.store.rewrite_server_id(cx.account_id, src, new_id).await?;
                    }
                    (Resolution::Success, Event::success("MVSUCCESS"))
                }
                4 => (Resolution::Success, Event::success("MVSAMEFOLDER")),
                5 => (
                    Resolution::HardFail(Why::LockedOnServer),
                    Event::hard_fail("MVLOCKED"),
                ),
                7 => (
                    Resolution::Deferred {
                        why: Why::LockedOnServer,
                        until: DeferUntil::Time(
                            Utc::now() + ChronoDuration::seconds(LOCKED_ITEM_RETRY_SECS),
                        ),
                    },
                    Event::new(EventKind::ReSync, "MVRETRY"),
                ),
                code => (
                    Resolution::HardFail(Why::Unknown),
                    Event::hard_fail(format!("MVSTATUS{}", code)),
                ),
            };

            self.queue.resolve_one(pending.id, resolution).await?;
            if rank(item_event.kind) > rank(event.kind) {
                event = item_event;
            }
        }

        // Items the server did not answer for are retried.
        let unanswered = self
            .queue
            .resolve_each(Resolution::Deferred {
                why: Why::Unknown,
                until: DeferUntil::Anytime,
            })
            .await?;
        if unanswered > 0 {
            tracing::warn!("MoveItems response omitted {} item(s)", unanswered);
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::State;
    use crate::store::LocalItem;
    use crate::testing::{Harness, json_response};
    use tokio_util::sync::CancellationToken;

    fn response(src: &str, status: &str, dst: Option<&str>) -> Element {
        Element::new(ns::MOVE, "Response")
            .with_leaf(ns::MOVE, "SrcMsgId", src)
            .with_leaf(ns::MOVE, "Status", status)
            .with_optional_leaf(ns::MOVE, "DstMsgId", dst)
    }

    async fn queue_move(harness: &Harness, op: Operation, src: &str) -> PendingOperation {
        harness
            .cx
            .store
            .insert_item(&LocalItem::new(1, src, "5", "Email"))
            .await
            .unwrap();
        let mut pending = PendingOperation::new(1, op)
            .with_server_id(src)
            .with_parent("5")
            .with_dest_parent("9")
            .with_defers(2);
        harness.cx.store.insert_pending(&mut pending).await.unwrap();
        pending
    }

    #[tokio::test]
    async fn test_batch_resolves_each_item_and_escalates_event() {
        let harness = Harness::new().await;
        let moved = queue_move(&harness, Operation::EmailMove, "5:1").await;
        let locked = queue_move(&harness, Operation::CalMove, "5:2").await;
        let bad_dest = queue_move(&harness, Operation::ContactMove, "5:3").await;
        let silent = queue_move(&harness, Operation::TaskMove, "5:4").await;

        let body = Document::new(
            Element::new(ns::MOVE, "MoveItems")
                .with(response("5:1", "3", Some("9:1")))
                .with(response("5:2", "7", None))
                .with(response("5:3", "2", None)),
        );
        harness.transport.push_response(json_response(&body));

        let command = MoveItems::claim(harness.cx.resolver(), 1, 16).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.kind, EventKind::ReFolderSync);
        let store = &harness.cx.store;

        let moved = store.get_pending(moved.id).await.unwrap().unwrap();
        assert!(moved.succeeded());
        let item = store.item(1, "9:1").await.unwrap().unwrap();
        assert_eq!(item.parent_id, "9");

        let locked = store.get_pending(locked.id).await.unwrap().unwrap();
        assert_eq!(locked.state, State::Deferred);
        assert!(matches!(locked.defer_until, Some(DeferUntil::Time(_))));

        let bad_dest = store.get_pending(bad_dest.id).await.unwrap().unwrap();
        assert_eq!(bad_dest.defer_until, Some(DeferUntil::FolderSync));
        assert_eq!(bad_dest.last_status, Some(2));

        let silent = store.get_pending(silent.id).await.unwrap().unwrap();
        assert_eq!(silent.state, State::Deferred);
        assert_eq!(silent.defer_until, Some(DeferUntil::Anytime));

        let request = harness.transport.request_document(0);
        assert_eq!(request.root.children_named("Move").count(), 4);
    }

    #[tokio::test]
    async fn test_batch_size_is_respected() {
        let harness = Harness::new().await;
        for i in 0..3 {
            queue_move(&harness, Operation::EmailMove, &format!("5:{}", i)).await;
        }

        let command = MoveItems::claim(harness.cx.resolver(), 1, 2).await.unwrap();
        assert_eq!(command.queue().snapshot().await.len(), 2);
    }
}
