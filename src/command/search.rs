//! Directory (GAL) search.

use anyhow::Result;

use super::{BuildError, Command, ResponseContext};
use crate::constants::SEARCH_RANGE;
use crate::pending::{
    AccountId, DeferUntil, Operation, PendingOperation, PendingQueue, Resolution, Resolver,
    StatusKind, Why,
};
use crate::protocol::document::{Element, ns};
use crate::protocol::{Document, Event, EventKind, ProtocolState};
use crate::store::DirectoryEntry;

pub struct Search {
    queue: PendingQueue,
}

impl Search {
    pub async fn claim(resolver: Resolver, account_id: AccountId) -> Result<Self> {
        Ok(Self {
            queue: PendingQueue::claim_single(resolver, account_id, &[Operation::ContactSearch])
                .await?,
        })
    }
}

fn deferred() -> Resolution {
    Resolution::Deferred {
        why: Why::ServerError,
        until: DeferUntil::Anytime,
    }
}

fn store_failure(code: u32) -> (Resolution, Event) {
    let mnemonic = format!("SRSTATUS{}", code);
    match code {
        2 | 4 | 8 => (
            Resolution::HardFail(Why::BadOrMalformed),
            Event::hard_fail(mnemonic),
        ),
        5 | 13 => (
            Resolution::HardFail(Why::AccessDeniedOrBlocked),
            Event::hard_fail(mnemonic),
        ),
        3 | 7 | 10 => (deferred(), Event::temp_fail(mnemonic)),
        11 => (
            Resolution::DeferredForce,
            Event::new(EventKind::ReFolderSync, mnemonic),
        ),
        12 => (
            Resolution::HardFail(Why::BeyondRange),
            Event::hard_fail(mnemonic),
        ),
        14 => (Resolution::DeferredForce, Event::new(EventKind::AuthFail, mnemonic)),
        _ => (Resolution::HardFail(Why::Unknown), Event::hard_fail(mnemonic)),
    }
}

fn directory_entry(result: &Element) -> Option<DirectoryEntry> {
    let properties = result.child("Properties")?;
    let email = properties.child_text_in(ns::GAL, "EmailAddress")?;
    Some(DirectoryEntry {
        email: email.to_string(),
        display_name: properties
            .child_text_in(ns::GAL, "DisplayName")
            .map(str::to_string),
        phone: properties.child_text_in(ns::GAL, "Phone").map(str::to_string),
    })
}

impl Command for Search {
    fn name(&self) -> &'static str {
        "Search"
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
        let query = op
            .payload
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| BuildError::missing(op, "query"))?;

        Ok(Some(Document::new(
            Element::new(ns::SEARCH, "Search").with(
                Element::new(ns::SEARCH, "Store")
                    .with_leaf(ns::SEARCH, "Name", "GAL")
                    .with_leaf(ns::SEARCH, "Query", query)
                    .with(
                        Element::new(ns::SEARCH, "Options")
                            .with_leaf(ns::SEARCH, "Range", SEARCH_RANGE),
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
            return Ok(Event::hard_fail("SRNOBODY"));
        };

        match document.status()? {
            Some(1) | None => {}
            Some(3) => {
                self.queue.record_status(3, StatusKind::CommandSpecific).await;
                self.queue.resolve_each(deferred()).await?;
                return Ok(Event::temp_fail("SRSERVERERR"));
            }
            Some(code) => {
                self.queue.record_status(code, StatusKind::CommandSpecific).await;
                self.queue
                    .resolve_each(Resolution::HardFail(Why::ProtocolError))
                    .await?;
                return Ok(Event::hard_fail(format!("SRSTATUS{}", code)));
            }
        }

        let Some(store) = document.root.child("Response").and_then(|r| r.child("Store")) else {
            self.queue
                .resolve_each(Resolution::HardFail(Why::ProtocolError))
                .await?;
            return Ok(Event::hard_fail("SRNOSTORE"));
        };

        let status = store.child_u32("Status")?.unwrap_or(0);
        self.queue.record_status(status, StatusKind::CommandSpecific).await;
        if status != 1 && status != 6 {
            let (resolution, event) = store_failure(status);
            self.queue.resolve_each(resolution).await?;
            return Ok(event);
        }

        // Status 6 is a partial result set; keep what arrived.
        let entries: Vec<DirectoryEntry> = store
            .children_named("Result")
            .filter_map(directory_entry)
            .collect();
        for pending in self.queue.snapshot().await {
            cx.store
                .save_directory_results(cx.account_id, &pending.token, &entries)
                .await?;
        }
        tracing::debug!("Directory search returned {} entries", entries.len());

        self.queue.resolve_each(Resolution::Success).await?;
        Ok(Event::success(if status == 6 { "SRPARTIAL" } else { "SRSUCCESS" }))
    }
}
