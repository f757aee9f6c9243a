//! Runs one command end to end.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Command, ResponseContext, http_status};
use crate::controller::EngineContext;
use crate::notification::OutcomeSummary;
use crate::pending::{AccountId, PendingQueue, Resolution, StatusKind, Why};
use crate::protocol::status;
use crate::protocol::{
    Event, EventKind, Transport, Verdict, WireError, WireOperation, WireRequest, WireResponse,
};

/// Executes commands for one account. A controller owns one and runs a single
/// command at a time through it.
pub struct Executor {
    account_id: AccountId,
    cx: EngineContext,
    transport: Arc<dyn Transport>,
}

impl Executor {
    pub fn new(account_id: AccountId, cx: EngineContext, transport: Arc<dyn Transport>) -> Self {
        Self {
            account_id,
            cx,
            transport,
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Run `command` and report its outcome. Every operation the command
    /// claimed is resolved by the time this returns.
    pub async fn execute<C: Command>(&self, command: &C, cancel: &CancellationToken) -> Event {
        let event = match self.run(command, cancel).await {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    "[account {}] {} failed: {:#}",
                    self.account_id,
                    command.name(),
                    e
                );
                Event::temp_fail("INTERNAL").with_message(format!("{:#}", e))
            }
        };

        if let Err(e) = command.queue().diaper(&event).await {
            tracing::error!("Failed to clean up after {}: {:#}", command.name(), e);
        }
        if event.kind == EventKind::AuthFail {
            self.cx
                .sink
                .notify(self.account_id, OutcomeSummary::AuthenticationRequired);
        }

        tracing::debug!("[account {}] {} -> {}", self.account_id, command.name(), event);
        event
    }

    async fn run<C: Command>(&self, command: &C, cancel: &CancellationToken) -> Result<Event> {
        let queue = command.queue();
        let pending = queue.snapshot().await;
        if command.requires_pending() && pending.is_empty() {
            tracing::debug!("{} has nothing to send", command.name());
            return Ok(Event::success("NOPENDING"));
        }

        let state = self
            .cx
            .store
            .protocol_state(self.account_id, &self.cx.policy.protocol_version)
            .await?;

        let document = match command.build_request(&state, &pending) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Could not build {} request: {}", command.name(), e);
                queue.resolve_each(Resolution::DeferredForce).await?;
                return Ok(Event::temp_fail("BUILDABORT").with_message(e.to_string()));
            }
        };

        let mut request = WireRequest::new(command.method(), command.name(), self.cx.codec.content_type())
            .header("MS-ASProtocolVersion", &state.protocol_version);
        if command.sends_policy_key() && state.is_provisioned() {
            request = request.header("X-MS-PolicyKey", &state.policy_key);
        }
        if let Some(document) = &document {
            match self.cx.codec.encode(document) {
                Ok(body) => request.body = Some(body),
                Err(e) => {
                    tracing::warn!("Could not encode {} request: {}", command.name(), e);
                    queue.resolve_each(Resolution::DeferredForce).await?;
                    return Ok(Event::temp_fail("BUILDABORT").with_message(e.to_string()));
                }
            }
        }

        let timeout = command.timeout(&state, &self.cx.policy);
        let wire = WireOperation::new(self.transport.as_ref(), &self.cx.policy.wire);
        let response = match wire.execute(&request, timeout, cancel).await {
            Ok(response) => response,
            Err(WireError::Cancelled) => {
                queue.cancel().await?;
                return Ok(Event::temp_fail("CANCELLED"));
            }
            Err(e) => {
                queue.resolve_each(Resolution::HardFail(Why::Unknown)).await?;
                return Ok(Event::hard_fail("WIREMAX").with_message(e.to_string()));
            }
        };

        if !queue.seize_cleanup().await {
            tracing::debug!("{} was cancelled before its response was processed", command.name());
            return Ok(Event::temp_fail("CANCELLED"));
        }

        let mut cx = ResponseContext {
            account_id: self.account_id,
            store: &self.cx.store,
            sink: self.cx.sink.as_ref(),
            policy: &self.cx.policy,
            headers: &response.headers,
            state: state.clone(),
        };
        let event = self.interpret(command, &mut cx, &response).await?;

        if cx.state != state {
            match self.cx.store.commit_protocol_state(&cx.state).await {
                Ok(_) => {}
                Err(e) if e.downcast_ref::<crate::store::StaleProtocolState>().is_some() => {
                    tracing::warn!("{}: {}, state change dropped", command.name(), e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(event)
    }

    async fn interpret<C: Command>(
        &self,
        command: &C,
        cx: &mut ResponseContext<'_>,
        response: &WireResponse,
    ) -> Result<Event> {
        let queue = command.queue();

        if let Some(verdict) = http_status::classify(response.status, &cx.state) {
            tracing::info!("{} returned HTTP {}", command.name(), response.status);
            return apply_verdict(queue, cx, verdict).await;
        }
        cx.state.consecutive_401 = 0;

        let document = if response.body.is_empty() {
            None
        } else {
            match self.cx.codec.decode(&response.body) {
                Ok(document) => Some(document),
                Err(e) => {
                    tracing::warn!("{} response could not be decoded: {}", command.name(), e);
                    queue.resolve_each(Resolution::HardFail(Why::ProtocolError)).await?;
                    return Ok(Event::hard_fail("BADBODY").with_message(e.to_string()));
                }
            }
        };

        if let Some(document) = &document {
            match document.status() {
                Ok(Some(code)) => {
                    let pending = queue.snapshot().await;
                    let verdict = command
                        .top_level_status(code, &pending)
                        .or_else(|| status::interpret(code));
                    if let Some(verdict) = verdict {
                        queue.record_status(code, StatusKind::TopLevel).await;
                        return apply_verdict(queue, cx, verdict).await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    queue.resolve_each(Resolution::HardFail(Why::ProtocolError)).await?;
                    return Ok(Event::hard_fail("BADSTATUS").with_message(e.to_string()));
                }
            }
        }

        // Whatever the handler left unresolved is force-deferred by the diaper.
        command
            .interpret_response(cx, document.as_ref())
            .await
            .with_context(|| format!("{} response handler failed", command.name()))
    }
}

async fn apply_verdict(
    queue: &PendingQueue,
    cx: &mut ResponseContext<'_>,
    verdict: Verdict,
) -> Result<Event> {
    if let Some(effect) = verdict.effect {
        cx.state.apply(effect);
    }
    queue.resolve_each(verdict.action.resolution()).await?;
    Ok(verdict.event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BuildError, SendMail};
    use crate::pending::{Operation, PendingOperation, State};
    use crate::protocol::document::{Element, ns};
    use crate::protocol::{Document, ProtocolState, TransportError};
    use crate::testing::{Harness, json_response};

    async fn queued_send(harness: &Harness) -> PendingOperation {
        let mut send = PendingOperation::new(1, Operation::EmailSend)
            .with_payload("MIME")
            .with_defers(3);
        harness.cx.store.insert_pending(&mut send).await.unwrap();
        send
    }

    async fn stored(harness: &Harness, id: i64) -> PendingOperation {
        harness.cx.store.get_pending(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_exhausted_transport_fails_pending_as_unknown() {
        let harness = Harness::new().await;
        let send = queued_send(&harness).await;
        for _ in 0..5 {
            harness
                .transport
                .push_error(TransportError::Connect("refused".to_string()));
        }

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.kind, EventKind::HardFail);
        assert_eq!(harness.transport.attempts(), 3);
        let send = stored(&harness, send.id).await;
        assert_eq!(send.state, State::Failed);
        assert_eq!(send.why, Some(Why::Unknown));
    }

    #[tokio::test]
    async fn test_cancel_mid_exchange_returns_pending_to_eligible() {
        let harness = Harness::new().await;
        let send = queued_send(&harness).await;
        harness.transport.push_hang();

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let event = harness.executor.execute(&command, &cancel).await;

        assert_eq!(event.kind, EventKind::TempFail);
        assert_eq!(stored(&harness, send.id).await.state, State::Eligible);
    }

    #[tokio::test]
    async fn test_top_level_status_uses_shared_table() {
        let harness = Harness::new().await;
        let send = queued_send(&harness).await;
        let body = Document::new(
            Element::new(ns::COMPOSE_MAIL, "SendMail").with_leaf(ns::COMPOSE_MAIL, "Status", "131"),
        );
        harness.transport.push_response(json_response(&body));

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.kind, EventKind::HardFail);
        assert_eq!(event.mnemonic, "TLS131");
        let send = stored(&harness, send.id).await;
        assert_eq!(send.state, State::Failed);
        assert_eq!(send.last_status, Some(131));
        assert_eq!(send.last_status_kind, Some(StatusKind::TopLevel));
    }

    #[tokio::test]
    async fn test_control_reset_force_defers() {
        let harness = Harness::new().await;
        let send = queued_send(&harness).await;
        harness.transport.push_response(WireResponse::new(449));

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.kind, EventKind::ReProvision);
        let send = stored(&harness, send.id).await;
        assert_eq!(send.state, State::Eligible);
        assert_eq!(send.defers_remaining, 3);
    }

    #[tokio::test]
    async fn test_401_counts_and_resets_on_success() {
        let harness = Harness::new().await;
        queued_send(&harness).await;
        harness.transport.push_response(WireResponse::new(401));

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;
        assert_eq!(event.kind, EventKind::AuthFail);
        assert_eq!(harness.state().await.consecutive_401, 1);
        assert!(harness.sink.summaries().contains(&(1, crate::OutcomeSummary::AuthenticationRequired)));

        harness.transport.push_response(WireResponse::new(200));
        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;
        assert_eq!(event.kind, EventKind::Success);
        assert_eq!(harness.state().await.consecutive_401, 0);
    }

    #[tokio::test]
    async fn test_build_failure_leaves_pending_eligible() {
        let harness = Harness::new().await;
        let mut send = PendingOperation::new(1, Operation::EmailSend).with_defers(3);
        harness.cx.store.insert_pending(&mut send).await.unwrap();

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.mnemonic, "BUILDABORT");
        assert_eq!(harness.transport.attempts(), 0);
        let send = stored(&harness, send.id).await;
        assert_eq!(send.state, State::Eligible);
        assert_eq!(send.defers_remaining, 3);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_protocol_error() {
        let harness = Harness::new().await;
        let send = queued_send(&harness).await;
        harness
            .transport
            .push_response(WireResponse::new(200).with_body(b"not a document".to_vec()));

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.mnemonic, "BADBODY");
        assert_eq!(stored(&harness, send.id).await.why, Some(Why::ProtocolError));
    }

    #[tokio::test]
    async fn test_requests_carry_version_and_policy_key() {
        let harness = Harness::new().await;
        let mut state = harness.state().await;
        state.policy_key = "12345".to_string();
        harness.cx.store.commit_protocol_state(&state).await.unwrap();
        queued_send(&harness).await;
        harness.transport.push_response(WireResponse::new(200));

        let command = SendMail::claim(harness.cx.resolver(), 1).await.unwrap();
        harness.executor.execute(&command, &CancellationToken::new()).await;

        let request = &harness.transport.requests()[0];
        assert_eq!(request.command, "SendMail");
        assert!(request.headers.contains(&("X-MS-PolicyKey".to_string(), "12345".to_string())));
        assert!(
            request
                .headers
                .contains(&("MS-ASProtocolVersion".to_string(), "14.1".to_string()))
        );
    }

    /// Claims mail like SendMail but cannot record the server's answer.
    struct FailingHandler {
        queue: PendingQueue,
    }

    impl Command for FailingHandler {
        fn name(&self) -> &'static str {
            "SendMail"
        }

        fn queue(&self) -> &PendingQueue {
            &self.queue
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
            _cx: &mut ResponseContext<'_>,
            _response: Option<&Document>,
        ) -> Result<Event> {
            anyhow::bail!("database is locked")
        }
    }

    #[tokio::test]
    async fn test_handler_error_force_defers_pending() {
        let harness = Harness::new().await;
        let send = queued_send(&harness).await;
        harness.transport.push_response(WireResponse::new(200));

        let command = FailingHandler {
            queue: PendingQueue::claim_single(harness.cx.resolver(), 1, &[Operation::EmailSend])
                .await
                .unwrap(),
        };
        let event = harness.executor.execute(&command, &CancellationToken::new()).await;

        assert_eq!(event.kind, EventKind::TempFail);
        assert_eq!(event.mnemonic, "INTERNAL");
        let send = stored(&harness, send.id).await;
        assert_eq!(send.state, State::Eligible);
        assert_eq!(send.defers_remaining, 3);
        assert!(harness.sink.summaries().is_empty());
    }
}
