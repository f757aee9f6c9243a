//! Options: capability discovery over HTTP OPTIONS.

use anyhow::Result;

use super::{BuildError, Command, ResponseContext};
use crate::constants::SUPPORTED_PROTOCOL_VERSIONS;
use crate::pending::{PendingOperation, PendingQueue, Resolver};
use crate::protocol::{Capabilities, Document, Event, Method, ProtocolState};

pub struct Options {
    queue: PendingQueue,
}

impl Options {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            queue: PendingQueue::empty(resolver),
        }
    }
}

/// Highest version both sides speak.
fn negotiate(advertised: &str) -> Option<&'static str> {
    let offered: Vec<&str> = advertised.split(',').map(str::trim).collect();
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .rev()
        .find(|version| offered.contains(version))
        .copied()
}

impl Command for Options {
    fn name(&self) -> &'static str {
        "Options"
    }

    fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn requires_pending(&self) -> bool {
        false
    }

    fn method(&self) -> Method {
        Method::Options
    }

    fn sends_policy_key(&self) -> bool {
        false
    }

    fn build_request(
        &self,
        _state: &ProtocolState,
        _pending: &[PendingOperation],
    ) -> Result<Option<Document>, BuildError> {
        Ok(None)
    }

    async fn interpret_response(
        &self,
        cx: &mut ResponseContext<'_>,
        _response: Option<&Document>,
    ) -> Result<Event> {
        let Some(versions) = cx.header("MS-ASProtocolVersions") else {
            return Ok(Event::hard_fail("OPTNOVER"));
        };
        let Some(version) = negotiate(versions) else {
            return Ok(Event::hard_fail("OPTBADVER").with_message(versions.to_string()));
        };

        let capabilities = cx
            .header("MS-ASProtocolCommands")
            .map(Capabilities::from_commands_header)
            .unwrap_or_default();

        tracing::info!(
            "[account {}] Negotiated protocol {} ({} commands)",
            cx.account_id,
            version,
            capabilities.iter().count()
        );
        cx.state.protocol_version = version.to_string();
        cx.state.capabilities = capabilities;
        Ok(Event::success("OPTSUCCESS"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventKind, WireResponse};
    use crate::testing::Harness;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_negotiate_picks_highest_common() {
        assert_eq!(negotiate("2.5,12.0,12.1,14.0"), Some("14.0"));
        assert_eq!(negotiate("2.5, 14.1, 16.0"), Some("14.1"));
        assert_eq!(negotiate("2.0,2.5"), None);
    }

    #[tokio::test]
    async fn test_discovery_updates_state() {
        let harness = Harness::new().await;
        harness.transport.push_response(
            WireResponse::new(200)
                .with_header("MS-ASProtocolVersions", "2.5,12.0,12.1")
                .with_header("MS-ASProtocolCommands", "Sync,FolderSync,SendMail,Provision"),
        );

        let command = Options::new(harness.cx.resolver());
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.mnemonic, "OPTSUCCESS");
        let state = harness.state().await;
        assert_eq!(state.protocol_version, "12.1");
        assert!(state.capabilities.contains(Capabilities::SEND_MAIL));
        assert!(!state.allows(Capabilities::PING));

        let request = &harness.transport.requests()[0];
        assert_eq!(request.method, Method::Options);
        assert!(request.body.is_none());
    }

    #[tokio::test]
    async fn test_missing_versions_header_fails() {
        let harness = Harness::new().await;
        harness.transport.push_response(WireResponse::new(200));

        let command = Options::new(harness.cx.resolver());
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.kind, EventKind::HardFail);
        assert_eq!(event.mnemonic, "OPTNOVER");
    }
}
