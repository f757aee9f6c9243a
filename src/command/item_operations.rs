//! ItemOperations: fetches one attachment by file reference.

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::{BuildError, Command, ResponseContext};
use crate::pending::{
    AccountId, Operation, PendingOperation, PendingQueue, Resolution, Resolver, StatusKind, Why,
};
use crate::protocol::document::{Element, ns};
use crate::protocol::{Document, Event, EventKind, PendingAction, ProtocolState, Verdict};

pub struct ItemOperations {
    queue: PendingQueue,
}

impl ItemOperations {
    pub async fn claim(resolver: Resolver, account_id: AccountId) -> Result<Self> {
        Ok(Self {
            queue: PendingQueue::claim_single(resolver, account_id, &[Operation::AttachmentDownload])
                .await?,
        })
    }
}

/// Fetch and command-level status codes other than success.
fn fetch_failure(code: u32) -> (Resolution, Event) {
    let mnemonic = format!("IOSTATUS{}", code);
    match code {
        2 | 8 | 9 | 15 | 155 => (
            Resolution::HardFail(Why::BadOrMalformed),
            Event::hard_fail(mnemonic),
        ),
        3 | 12 | 14 => (
            Resolution::HardFail(Why::ServerError),
            Event::hard_fail(mnemonic),
        ),
        4..=7 | 16 | 17 | 156 => (
            Resolution::HardFail(Why::AccessDeniedOrBlocked),
            Event::hard_fail(mnemonic),
        ),
        10 => (
            Resolution::HardFail(Why::MissingOnServer),
            Event::hard_fail(mnemonic),
        ),
        11 => (Resolution::HardFail(Why::TooBig), Event::hard_fail(mnemonic)),
        18 => (Resolution::DeferredForce, Event::new(EventKind::AuthFail, mnemonic)),
        _ => (Resolution::HardFail(Why::Unknown), Event::hard_fail(mnemonic)),
    }
}

impl Command for ItemOperations {
    fn name(&self) -> &'static str {
        "ItemOperations"
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
        let file_reference = op
            .server_id
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "file reference"))?;

        Ok(Some(Document::new(
            Element::new(ns::ITEM_OPERATIONS, "ItemOperations").with(
                Element::new(ns::ITEM_OPERATIONS, "Fetch")
                    .with_leaf(ns::ITEM_OPERATIONS, "Store", "Mailbox")
                    .with_leaf(ns::AIRSYNC_BASE, "FileReference", file_reference),
            ),
        )))
    }

    // These two are ItemOperations' own meanings, not the shared ones.
    fn top_level_status(&self, code: u32, _pending: &[PendingOperation]) -> Option<Verdict> {
        let action = match code {
            155 => PendingAction::HardFail(Why::BadOrMalformed),
            156 => PendingAction::HardFail(Why::AccessDeniedOrBlocked),
            _ => return None,
        };
        Some(Verdict::new(
            code,
            action,
            Event::hard_fail(format!("IOSTATUS{}", code)),
        ))
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
            return Ok(Event::hard_fail("IONOBODY"));
        };

        if let Some(code) = document.status()?.filter(|code| *code != 1) {
            self.queue.record_status(code, StatusKind::CommandSpecific).await;
            let (resolution, event) = fetch_failure(code);
            self.queue.resolve_each(resolution).await?;
            return Ok(event);
        }

        let Some(fetch) = document
            .root
            .child("Response")
            .and_then(|r| r.child("Fetch"))
        else {
            self.queue
                .resolve_each(Resolution::HardFail(Why::ProtocolError))
                .await?;
            return Ok(Event::hard_fail("IONOFETCH"));
        };

        let status = fetch.child_u32("Status")?.unwrap_or(0);
        self.queue.record_status(status, StatusKind::CommandSpecific).await;
        if status != 1 {
            let (resolution, event) = fetch_failure(status);
            self.queue.resolve_each(resolution).await?;
            return Ok(event);
        }

        let Some(pending) = self.queue.snapshot().await.into_iter().next() else {
            return Ok(Event::success("IOSUCCESS"));
        };
        let file_reference = fetch
            .child_text_in(ns::AIRSYNC_BASE, "FileReference")
            .or(pending.server_id.as_deref())
            .unwrap_or_default();

        let properties = fetch.child("Properties");
        let content_type = properties.and_then(|p| p.child_text_in(ns::AIRSYNC_BASE, "ContentType"));
        let data = match properties.and_then(|p| p.child_text("Data")) {
            Some(encoded) => match STANDARD.decode(encoded.trim()) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Attachment {} has undecodable data: {}", file_reference, e);
                    self.queue
                        .resolve_each(Resolution::HardFail(Why::ProtocolError))
                        .await?;
                    return Ok(Event::hard_fail("IOBADDATA"));
                }
            },
            None => Vec::new(),
        };

        cx.store
            .save_attachment(cx.account_id, file_reference, content_type, &data)
            .await?;
        tracing::debug!("Saved attachment {} ({} bytes)", file_reference, data.len());

        self.queue.resolve_each(Resolution::Success).await?;
        Ok(Event::success("IOSUCCESS"))
    }
}
