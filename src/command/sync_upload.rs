//! Sync upload of locally created calendar items.
//!
//! Each upload claims one CalCreate, sends it as an Add under the target
//! folder's sync key, and swaps the item's placeholder id for the one the
//! server assigns.

use anyhow::Result;
use serde::Deserialize;

use super::{BuildError, Command, ResponseContext};
use crate::constants::INITIAL_SYNC_KEY;
use crate::pending::{
    AccountId, DeferUntil, Operation, PendingOperation, PendingQueue, Resolution, Resolver,
    StatusKind, Why, is_placeholder,
};
use crate::protocol::document::{Element, ns};
use crate::protocol::{Document, Event, EventKind, ProtocolState};

/// Calendar fields carried in a CalCreate payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CalendarItem {
    subject: String,
    start_time: String,
    end_time: String,
    #[serde(default)]
    location: Option<String>,
}

pub struct SyncUpload {
    queue: PendingQueue,
    /// Sync key of the target folder when the operation was claimed.
    sync_key: Option<String>,
}

impl SyncUpload {
    pub async fn claim(resolver: Resolver, account_id: AccountId) -> Result<Self> {
        let queue =
            PendingQueue::claim_single(resolver.clone(), account_id, &[Operation::CalCreate]).await?;

        let mut sync_key = None;
        if let Some(parent) = queue.snapshot().await.first().and_then(|p| p.parent_id.clone()) {
            sync_key = resolver
                .store()
                .folder(account_id, &parent)
                .await?
                .map(|folder| folder.sync_key);
        }

        Ok(Self { queue, sync_key })
    }
}

fn collection_failure(code: u32, cx: &mut ResponseContext<'_>) -> (Resolution, Event, bool) {
    let mnemonic = format!("SUSTATUS{}", code);
    match code {
        3 => (
            Resolution::DeferredForce,
            Event::new(EventKind::ReSync, mnemonic),
            true,
        ),
        4 => (
            Resolution::HardFail(Why::ProtocolError),
            Event::hard_fail(mnemonic),
            false,
        ),
        5 | 16 => (
            Resolution::Deferred {
                why: Why::ServerError,
                until: DeferUntil::Anytime,
            },
            Event::temp_fail(mnemonic),
            false,
        ),
        6 => (
            Resolution::HardFail(Why::BadOrMalformed),
            Event::hard_fail(mnemonic),
            false,
        ),
        7 => (
            Resolution::HardFail(Why::ConflictWithServer),
            Event::hard_fail(mnemonic),
            false,
        ),
        8 => (
            Resolution::Deferred {
                why: Why::MissingOnServer,
                until: DeferUntil::FolderSync,
            },
            Event::new(EventKind::ReFolderSync, mnemonic),
            false,
        ),
        9 | 12 => {
            cx.state.reset_folder_sync();
            (
                Resolution::DeferredForce,
                Event::new(EventKind::ReFolderSync, mnemonic),
                false,
            )
        }
        _ => (
            Resolution::HardFail(Why::Unknown),
            Event::hard_fail(mnemonic),
            false,
        ),
    }
}

impl Command for SyncUpload {
    fn name(&self) -> &'static str {
        "Sync"
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
        let folder = op
            .parent_id
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "calendar folder"))?;
        if is_placeholder(folder) {
            return Err(BuildError::UnresolvedPlaceholder("CollectionId"));
        }
        let sync_key = self
            .sync_key
            .as_deref()
            .filter(|key| *key != INITIAL_SYNC_KEY)
            .ok_or_else(|| BuildError::missing(op, "folder sync key"))?;
        let client_id = op
            .server_id
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "client id"))?;

        let payload = op
            .payload
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "calendar item"))?;
        let item: CalendarItem = serde_json::from_str(payload)
            .map_err(|e| BuildError::InvalidPayload(e.to_string()))?;

        let data = Element::new(ns::AIRSYNC, "ApplicationData")
            .with_leaf(ns::CALENDAR, "Subject", item.subject)
            .with_leaf(ns::CALENDAR, "StartTime", item.start_time)
            .with_leaf(ns::CALENDAR, "EndTime", item.end_time)
            .with_optional_leaf(ns::CALENDAR, "Location", item.location.as_deref());

        Ok(Some(Document::new(
            Element::new(ns::AIRSYNC, "Sync").with(
                Element::new(ns::AIRSYNC, "Collections").with(
                    Element::new(ns::AIRSYNC, "Collection")
                        .with_leaf(ns::AIRSYNC, "SyncKey", sync_key)
                        .with_leaf(ns::AIRSYNC, "CollectionId", folder)
                        .with(
                            Element::new(ns::AIRSYNC, "Commands").with(
                                Element::new(ns::AIRSYNC, "Add")
                                    .with_leaf(ns::AIRSYNC, "ClientId", client_id)
                                    .with(data),
                            ),
                        ),
                ),
            ),
        )))
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
            return Ok(Event::hard_fail("SUNOBODY"));
        };
        let Some(pending) = self.queue.snapshot().await.into_iter().next() else {
            return Ok(Event::success("SUNOPENDING"));
        };
        let folder = pending.parent_id.clone().unwrap_or_default();

        let collection = document
            .root
            .child("Collections")
            .and_then(|c| c.children_named("Collection").next());
        let status = match collection {
            Some(collection) => collection.child_u32("Status")?,
            None => document.status()?,
        }
        .unwrap_or(0);
        self.queue.record_status(status, StatusKind::CommandSpecific).await;

        let Some(collection) = collection.filter(|_| status == 1) else {
            let (resolution, event, reset_key) = collection_failure(status, cx);
            if reset_key {
                cx.store
                    .set_folder_sync_key(cx.account_id, &folder, INITIAL_SYNC_KEY)
                    .await?;
            }
            self.queue.resolve_each(resolution).await?;
            return Ok(event);
        };

        if let Some(key) = collection.child_text("SyncKey") {
            cx.store.set_folder_sync_key(cx.account_id, &folder, key).await?;
        }

        let client_id = pending.server_id.as_deref().unwrap_or_default();
        let add = collection.child("Responses").and_then(|responses| {
            responses
                .children_named("Add")
                .find(|add| add.child_text("ClientId") == Some(client_id))
        });
        let Some(add) = add else {
            tracing::warn!("Sync response did not answer for {}", client_id);
            self.queue
                .resolve_each(Resolution::Deferred {
                    why: Why::Unknown,
                    until: DeferUntil::Anytime,
                })
                .await?;
            return Ok(Event::temp_fail("SUNOADD"));
        };

        let add_status = add.child_u32("Status")?.unwrap_or(0);
        if add_status != 1 {
            self.queue
                .record_status(add_status, StatusKind::CommandSpecific)
                .await;
            let (resolution, event, _) = collection_failure(add_status, cx);
            self.queue.resolve_each(resolution).await?;
            return Ok(event);
        }

        match add.child_text("ServerId") {
            Some(server_id) => {
                cx.store
                    .rewrite_server_id(cx.account_id, client_id, server_id)
                    .await?;
            }
            None => tracing::warn!("Sync Add for {} carried no ServerId", client_id),
        }

        self.queue.resolve_each(Resolution::Success).await?;
        Ok(Event::success("SUSUCCESS"))
    }
}
