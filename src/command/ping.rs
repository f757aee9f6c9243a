//! Ping: server-side long-poll over the watched folders.

use anyhow::Result;
use std::time::Duration;

use super::{BuildError, Command, ResponseContext};
use crate::controller::EnginePolicy;
use crate::notification::OutcomeSummary;
use crate::pending::{PendingOperation, PendingQueue, Resolver};
use crate::protocol::document::{Element, ns};
use crate::protocol::{Document, Event, EventKind, ProtocolState};

/// A folder Ping watches, with the item class the server expects for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFolder {
    pub server_id: String,
    pub class: &'static str,
}

impl WatchedFolder {
    pub fn new(server_id: impl Into<String>, folder_type: Option<u32>) -> Self {
        let class = match folder_type {
            Some(7 | 15) => "Tasks",
            Some(8 | 13) => "Calendar",
            Some(9 | 14) => "Contacts",
            _ => "Email",
        };
        Self {
            server_id: server_id.into(),
            class,
        }
    }
}

pub struct Ping {
    queue: PendingQueue,
    folders: Vec<WatchedFolder>,
}

impl Ping {
    pub fn new(resolver: Resolver, folders: Vec<WatchedFolder>) -> Self {
        Self {
            queue: PendingQueue::empty(resolver),
            folders,
        }
    }
}

impl Command for Ping {
    fn name(&self) -> &'static str {
        "Ping"
    }

    fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn requires_pending(&self) -> bool {
        false
    }

    /// The server holds the request for a whole heartbeat.
    fn timeout(&self, state: &ProtocolState, policy: &EnginePolicy) -> Duration {
        Duration::from_secs(u64::from(state.heartbeat_secs)) + policy.ping_slack
    }

    fn build_request(
        &self,
        state: &ProtocolState,
        _pending: &[PendingOperation],
    ) -> Result<Option<Document>, BuildError> {
        if self.folders.len() > state.max_folders as usize {
            tracing::warn!(
                "Watching {} folders, server allows {}",
                self.folders.len(),
                state.max_folders
            );
        }

        let mut folders = Element::new(ns::PING, "Folders");
        for folder in self.folders.iter().take(state.max_folders as usize) {
            folders = folders.with(
                Element::new(ns::PING, "Folder")
                    .with_leaf(ns::PING, "Id", &folder.server_id)
                    .with_leaf(ns::PING, "Class", folder.class),
            );
        }

        Ok(Some(Document::new(
            Element::new(ns::PING, "Ping")
                .with_leaf(ns::PING, "HeartbeatInterval", state.heartbeat_secs.to_string())
                .with(folders),
        )))
    }

    async fn interpret_response(
        &self,
        cx: &mut ResponseContext<'_>,
        response: Option<&Document>,
    ) -> Result<Event> {
        let Some(document) = response else {
            return Ok(Event::hard_fail("PINGNOBODY"));
        };

        let event = match document.status()?.unwrap_or(0) {
            1 => Event::success("PINGNOCHANGE"),
            2 => {
                let changed: Vec<String> = document
                    .root
                    .child("Folders")
                    .map(|f| {
                        f.children_named("Folder")
                            .filter_map(|folder| folder.text.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                tracing::debug!("Ping reported changes in {:?}", changed);
                cx.sink
                    .notify(cx.account_id, OutcomeSummary::FoldersChanged { folders: changed });
                Event::new(EventKind::ReSync, "PINGCHANGES")
            }
            3 => Event::temp_fail("PINGMISSING"),
            4 => Event::hard_fail("PINGSYNTAX"),
            5 => {
                if let Some(secs) = document.root.child_u32("HeartbeatInterval")? {
                    let clamped = cx.policy.clamp_heartbeat(secs);
                    tracing::info!("Server wants heartbeat {}s, using {}s", secs, clamped);
                    cx.state.heartbeat_secs = clamped;
                }
                Event::temp_fail("PINGHBI")
            }
            6 => {
                if let Some(max) = document.root.child_u32("MaxFolders")? {
                    cx.state.max_folders = max;
                }
                Event::temp_fail("PINGMAXFOLDERS")
            }
            7 => Event::new(EventKind::ReFolderSync, "PINGFSYNC"),
            8 => Event::temp_fail("PINGSERVERERR"),
            code => Event::hard_fail(format!("PINGSTATUS{}", code)),
        };
        Ok(event)
    }
}
