//! Folder hierarchy commands.
//!
//! All three share the hierarchy sync key and are claimed one at a time per
//! account, so each response can advance the key without racing another.

use anyhow::Result;

use super::{BuildError, Command, ResponseContext};
use crate::constants::FOLDER_TYPE_USER_MAIL;
use crate::pending::{
    AccountId, BlockReason, DeferUntil, Operation, PendingOperation, PendingQueue, Resolution,
    Resolver, StatusKind, Why, is_placeholder,
};
use crate::protocol::document::{Element, ns};
use crate::protocol::{Document, Event, EventKind, ProtocolState};
use crate::store::LocalFolder;

const ROOT_FOLDER: &str = "0";

/// Outcomes every hierarchy command shares. Status 9 also discards the
/// hierarchy sync key.
fn shared_status(
    code: u32,
    prefix: &str,
    cx: &mut ResponseContext<'_>,
) -> Option<(Resolution, Event)> {
    let deferred = Resolution::Deferred {
        why: Why::ServerError,
        until: DeferUntil::Anytime,
    };
    match code {
        6 => Some((deferred, Event::temp_fail(format!("{}SERVERR", prefix)))),
        9 => {
            cx.state.reset_folder_sync();
            Some((
                Resolution::DeferredForce,
                Event::new(EventKind::ReFolderSync, format!("{}FSYNCVER", prefix)),
            ))
        }
        10 => Some((
            Resolution::HardFail(Why::BadOrMalformed),
            Event::hard_fail(format!("{}BADFORMAT", prefix)),
        )),
        11 => Some((deferred, Event::temp_fail(format!("{}UNKNOWN", prefix)))),
        12 => Some((deferred, Event::temp_fail(format!("{}CODEUNK", prefix)))),
        _ => None,
    }
}

/// A parent the server does not know: retry after a folder resync while the
/// operation has defers left, then ask the user for another parent.
fn bad_parent(pending: &PendingOperation, prefix: &str) -> (Resolution, Event) {
    if pending.defers_remaining > 0 {
        (
            Resolution::Deferred {
                why: Why::MissingOnServer,
                until: DeferUntil::FolderSync,
            },
            Event::new(EventKind::ReFolderSync, format!("{}BADPARENT", prefix)),
        )
    } else {
        (
            Resolution::UserBlocked(BlockReason::MustPickNewParent, Why::MissingOnServer),
            Event::hard_fail(format!("{}BADPARENT", prefix)),
        )
    }
}

fn advance_sync_key(cx: &mut ResponseContext<'_>, response: &Element) {
    if let Some(key) = response.child_text("SyncKey") {
        cx.state.folder_sync_key = key.to_string();
    }
}

/// The one claimed operation and the response's status, or the event to
/// return when either is missing.
async fn single_with_status<'d>(
    queue: &PendingQueue,
    response: Option<&'d Document>,
    prefix: &str,
) -> Result<Result<(PendingOperation, &'d Element, u32), Event>> {
    let Some(pending) = queue.snapshot().await.into_iter().next() else {
        return Ok(Err(Event::success(format!("{}NOPENDING", prefix))));
    };
    let Some(document) = response else {
        queue.resolve_each(Resolution::HardFail(Why::ProtocolError)).await?;
        return Ok(Err(Event::hard_fail(format!("{}NOBODY", prefix))));
    };
    let Some(status) = document.status()? else {
        queue.resolve_each(Resolution::HardFail(Why::ProtocolError)).await?;
        return Ok(Err(Event::hard_fail(format!("{}NOSTATUS", prefix))));
    };
    queue.record_status(status, StatusKind::CommandSpecific).await;
    Ok(Ok((pending, &document.root, status)))
}

fn confirmed_parent(pending: &PendingOperation) -> Result<&str, BuildError> {
    let parent = pending.parent_id.as_deref().unwrap_or(ROOT_FOLDER);
    if is_placeholder(parent) {
        return Err(BuildError::UnresolvedPlaceholder("ParentId"));
    }
    Ok(parent)
}

pub struct FolderCreate {
    queue: PendingQueue,
}

impl FolderCreate {
    pub async fn claim(resolver: Resolver, account_id: AccountId) -> Result<Self> {
        Ok(Self {
            queue: PendingQueue::claim_single(resolver, account_id, &[Operation::FolderCreate])
                .await?,
        })
    }
}

impl Command for FolderCreate {
    fn name(&self) -> &'static str {
        "FolderCreate"
    }

    fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn build_request(
        &self,
        state: &ProtocolState,
        pending: &[PendingOperation],
    ) -> Result<Option<Document>, BuildError> {
        let Some(op) = pending.first() else {
            return Ok(None);
        };
        let name = op
            .display_name
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "display name"))?;

        Ok(Some(Document::new(
            Element::new(ns::FOLDER_HIERARCHY, "FolderCreate")
                .with_leaf(ns::FOLDER_HIERARCHY, "SyncKey", &state.folder_sync_key)
                .with_leaf(ns::FOLDER_HIERARCHY, "ParentId", confirmed_parent(op)?)
                .with_leaf(ns::FOLDER_HIERARCHY, "DisplayName", name)
                .with_leaf(
                    ns::FOLDER_HIERARCHY,
                    "Type",
                    op.folder_type.unwrap_or(FOLDER_TYPE_USER_MAIL).to_string(),
                ),
        )))
    }

    async fn interpret_response(
        &self,
        cx: &mut ResponseContext<'_>,
        response: Option<&Document>,
    ) -> Result<Event> {
        let (pending, root, status) = match single_with_status(&self.queue, response, "FC").await? {
            Ok(found) => found,
            Err(event) => return Ok(event),
        };

        let (resolution, event) = match status {
            1 => {
                let Some(server_id) = root.child_text("ServerId") else {
                    self.queue
                        .resolve_one(pending.id, Resolution::HardFail(Why::ProtocolError))
                        .await?;
                    return Ok(Event::hard_fail("FCNOSERVERID"));
                };

                let parent_id = pending.parent_id.as_deref().unwrap_or(ROOT_FOLDER);
                let display_name = pending.display_name.as_deref().unwrap_or_default();
                match pending.server_id.as_deref().filter(|id| is_placeholder(id)) {
                    Some(placeholder) => {
                        cx.store
                            .confirm_folder(
                                cx.account_id,
                                placeholder,
                                server_id,
                                parent_id,
                                display_name,
                            )
                            .await?;
                    }
                    None => {
                        cx.store
                            .insert_folder(&LocalFolder::new(
                                cx.account_id,
                                server_id,
                                parent_id,
                                display_name,
                                pending.folder_type.unwrap_or(FOLDER_TYPE_USER_MAIL),
                            ))
                            .await?;
                    }
                }
                advance_sync_key(cx, root);
                tracing::info!("Folder created with server id {}", server_id);
                (Resolution::Success, Event::success("FCSUCCESS"))
            }
            2 => (
                Resolution::UserBlocked(BlockReason::MustChangeName, Why::AlreadyExists),
                Event::hard_fail("FCEXISTS"),
            ),
            3 => (
                Resolution::UserBlocked(BlockReason::MustPickNewParent, Why::SpecialFolder),
                Event::hard_fail("FCSPECIAL"),
            ),
            5 => bad_parent(&pending, "FC"),
            code => match shared_status(code, "FC", cx) {
                Some(outcome) => outcome,
                None => (
                    Resolution::HardFail(Why::Unknown),
                    Event::hard_fail(format!("FCSTATUS{}", code)),
                ),
            },
        };

        self.queue.resolve_one(pending.id, resolution).await?;
        Ok(event)
    }
}

pub struct FolderUpdate {
    queue: PendingQueue,
}

impl FolderUpdate {
    pub async fn claim(resolver: Resolver, account_id: AccountId) -> Result<Self> {
        Ok(Self {
            queue: PendingQueue::claim_single(resolver, account_id, &[Operation::FolderUpdate])
                .await?,
        })
    }
}

impl Command for FolderUpdate {
    fn name(&self) -> &'static str {
        "FolderUpdate"
    }

    fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn build_request(
        &self,
        state: &ProtocolState,
        pending: &[PendingOperation],
    ) -> Result<Option<Document>, BuildError> {
        let Some(op) = pending.first() else {
            return Ok(None);
        };
        let server_id = op
            .server_id
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "server id"))?;
        if is_placeholder(server_id) {
            return Err(BuildError::UnresolvedPlaceholder("ServerId"));
        }
        let name = op
            .display_name
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "display name"))?;

        Ok(Some(Document::new(
            Element::new(ns::FOLDER_HIERARCHY, "FolderUpdate")
                .with_leaf(ns::FOLDER_HIERARCHY, "SyncKey", &state.folder_sync_key)
                .with_leaf(ns::FOLDER_HIERARCHY, "ServerId", server_id)
                .with_leaf(ns::FOLDER_HIERARCHY, "ParentId", confirmed_parent(op)?)
                .with_leaf(ns::FOLDER_HIERARCHY, "DisplayName", name),
        )))
    }

    async fn interpret_response(
        &self,
        cx: &mut ResponseContext<'_>,
        response: Option<&Document>,
    ) -> Result<Event> {
        let (pending, root, status) = match single_with_status(&self.queue, response, "FU").await? {
            Ok(found) => found,
            Err(event) => return Ok(event),
        };

        let (resolution, event) = match status {
            1 => {
                if let (Some(server_id), Some(name)) =
                    (pending.server_id.as_deref(), pending.display_name.as_deref())
                {
                    cx.store
                        .update_folder(
                            cx.account_id,
                            server_id,
                            pending.parent_id.as_deref().unwrap_or(ROOT_FOLDER),
                            name,
                        )
                        .await?;
                }
                advance_sync_key(cx, root);
                (Resolution::Success, Event::success("FUSUCCESS"))
            }
            2 => (
                Resolution::UserBlocked(BlockReason::MustChangeName, Why::AlreadyExists),
                Event::hard_fail("FUEXISTS"),
            ),
            3 => (
                Resolution::HardFail(Why::SpecialFolder),
                Event::hard_fail("FUSPECIAL"),
            ),
            4 => (
                Resolution::HardFail(Why::MissingOnServer),
                Event::new(EventKind::ReFolderSync, "FUMISSING"),
            ),
            5 => bad_parent(&pending, "FU"),
            code => match shared_status(code, "FU", cx) {
                Some(outcome) => outcome,
                None => (
                    Resolution::HardFail(Why::Unknown),
                    Event::hard_fail(format!("FUSTATUS{}", code)),
                ),
            },
        };

        self.queue.resolve_one(pending.id, resolution).await?;
        Ok(event)
    }
}

pub struct FolderDelete {
    queue: PendingQueue,
}

impl FolderDelete {
    pub async fn claim(resolver: Resolver, account_id: AccountId) -> Result<Self> {
        Ok(Self {
            queue: PendingQueue::claim_single(resolver, account_id, &[Operation::FolderDelete])
                .await?,
        })
    }
}

impl Command for FolderDelete {
    fn name(&self) -> &'static str {
        "FolderDelete"
    }

    fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn build_request(
        &self,
        state: &ProtocolState,
        pending: &[PendingOperation],
    ) -> Result<Option<Document>, BuildError> {
        let Some(op) = pending.first() else {
            return Ok(None);
        };
        let server_id = op
            .server_id
            .as_deref()
            .ok_or_else(|| BuildError::missing(op, "server id"))?;
        if is_placeholder(server_id) {
            return Err(BuildError::UnresolvedPlaceholder("ServerId"));
        }

        Ok(Some(Document::new(
            Element::new(ns::FOLDER_HIERARCHY, "FolderDelete")
                .with_leaf(ns::FOLDER_HIERARCHY, "SyncKey", &state.folder_sync_key)
                .with_leaf(ns::FOLDER_HIERARCHY, "ServerId", server_id),
        )))
    }

    async fn interpret_response(
        &self,
        cx: &mut ResponseContext<'_>,
        response: Option<&Document>,
    ) -> Result<Event> {
        let (pending, root, status) = match single_with_status(&self.queue, response, "FD").await? {
            Ok(found) => found,
            Err(event) => return Ok(event),
        };

        let (resolution, event) = match status {
            1 | 4 => {
                if let Some(server_id) = pending.server_id.as_deref() {
                    cx.store.delete_folder(cx.account_id, server_id).await?;
                }
                if status == 1 {
                    advance_sync_key(cx, root);
                    (Resolution::Success, Event::success("FDSUCCESS"))
                } else {
                    // Already gone on the server; our hierarchy is stale.
                    (
                        Resolution::Success,
                        Event::new(EventKind::ReFolderSync, "FDMISSING"),
                    )
                }
            }
            3 => (
                Resolution::HardFail(Why::SpecialFolder),
                Event::hard_fail("FDSPECIAL"),
            ),
            code => match shared_status(code, "FD", cx) {
                Some(outcome) => outcome,
                None => (
                    Resolution::HardFail(Why::Unknown),
                    Event::hard_fail(format!("FDSTATUS{}", code)),
                ),
            },
        };

        self.queue.resolve_one(pending.id, resolution).await?;
        Ok(event)
    }
}
