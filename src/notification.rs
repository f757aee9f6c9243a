//! User-visible outcome notifications.
//!
//! The engine reports through a fire-and-forget `NotificationSink`; it never
//! waits on or depends on delivery.

use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::pending::{AccountId, BlockReason, Operation, Why};

/// A state change worth surfacing outside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeSummary {
    Succeeded {
        operation: Operation,
        token: String,
    },
    Failed {
        operation: Operation,
        token: String,
        why: Why,
    },
    Blocked {
        operation: Operation,
        token: String,
        reason: BlockReason,
        why: Why,
    },
    FoldersChanged {
        folders: Vec<String>,
    },
    FolderListChanged,
    AuthenticationRequired,
    WipeRequested,
}

impl OutcomeSummary {
    /// Needs the user to do something.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            OutcomeSummary::Failed { .. }
                | OutcomeSummary::Blocked { .. }
                | OutcomeSummary::AuthenticationRequired
                | OutcomeSummary::WipeRequested
        )
    }

    pub fn headline(&self) -> String {
        match self {
            OutcomeSummary::Succeeded { operation, .. } => format!("{} completed", operation),
            OutcomeSummary::Failed { operation, why, .. } => {
                format!("{} failed: {}", operation, why)
            }
            OutcomeSummary::Blocked {
                operation, reason, ..
            } => format!("{} needs attention: {}", operation, reason),
            OutcomeSummary::FoldersChanged { folders } => {
                format!("{} folder(s) changed on the server", folders.len())
            }
            OutcomeSummary::FolderListChanged => "Folder list changed".to_string(),
            OutcomeSummary::AuthenticationRequired => "Sign-in required".to_string(),
            OutcomeSummary::WipeRequested => "Server requested a remote wipe".to_string(),
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, account_id: AccountId, summary: OutcomeSummary);
}

/// Writes every summary to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, account_id: AccountId, summary: OutcomeSummary) {
        if summary.is_actionable() {
            tracing::warn!("[account {}] {}", account_id, summary.headline());
        } else {
            tracing::info!("[account {}] {}", account_id, summary.headline());
        }
    }
}

/// Forwards summaries to a channel, for front-ends embedding the engine.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(AccountId, OutcomeSummary)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(AccountId, OutcomeSummary)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, account_id: AccountId, summary: OutcomeSummary) {
        if self.tx.send((account_id, summary)).is_err() {
            tracing::debug!("Notification receiver dropped");
        }
    }
}

/// Logs everything and raises a desktop notification for actionable summaries
/// of accounts with notifications enabled.
pub struct DesktopSink {
    log: LogSink,
    enabled: HashSet<AccountId>,
}

impl DesktopSink {
    pub fn from_config(config: &Config) -> Self {
        let enabled = config
            .accounts
            .iter()
            .filter(|account| config.notifications_enabled_for(account))
            .map(|account| account.id)
            .collect();

        Self {
            log: LogSink,
            enabled,
        }
    }
}

impl NotificationSink for DesktopSink {
    fn notify(&self, account_id: AccountId, summary: OutcomeSummary) {
        let show = summary.is_actionable() && self.enabled.contains(&account_id);
        let headline = summary.headline();
        self.log.notify(account_id, summary);

        if show {
            // Fire and forget, don't block on errors
            if let Err(e) = send_notification(&headline) {
                tracing::warn!("Failed to send desktop notification: {}", e);
            }
        }
    }
}

#[cfg(feature = "notifications")]
fn send_notification(summary: &str) -> Result<(), notify_rust::error::Error> {
    use notify_rust::Notification;

    let mut notification = Notification::new();
    notification
        .summary(summary)
        .appname("airsync")
        .timeout(notify_rust::Timeout::Milliseconds(5000));

    notification.icon("dialog-warning");

    notification.show()?;
    Ok(())
}

#[cfg(not(feature = "notifications"))]
fn send_notification(_summary: &str) -> Result<(), std::convert::Infallible> {
    Ok(())
}
