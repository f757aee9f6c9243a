//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::command::Executor;
use crate::controller::{EngineContext, EnginePolicy};
use crate::notification::{NotificationSink, OutcomeSummary};
use crate::pending::{AccountId, Resolver};
use crate::protocol::{
    Document, DocumentCodec, JsonCodec, ProtocolState, Transport, TransportError, WireRequest,
    WireResponse,
};
use crate::retry::RetryConfig;
use crate::store::Store;

pub async fn test_store() -> Arc<Store> {
    Arc::new(Store::open_in_memory().await.unwrap())
}

pub async fn test_resolver() -> (Resolver, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    (Resolver::new(test_store().await, sink.clone()), sink)
}

/// Keeps every summary it is handed.
#[derive(Default)]
pub struct RecordingSink {
    summaries: Mutex<Vec<(AccountId, OutcomeSummary)>>,
}

impl RecordingSink {
    pub fn summaries(&self) -> Vec<(AccountId, OutcomeSummary)> {
        self.summaries.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, account_id: AccountId, summary: OutcomeSummary) {
        self.summaries.lock().unwrap().push((account_id, summary));
    }
}

enum Scripted {
    Respond(WireResponse),
    Fail(TransportError),
    /// Never answers; resolves only through cancellation.
    Hang,
}

/// Replays a script of responses, one per exchange.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<(WireRequest, Duration)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: WireResponse) {
        self.script.lock().unwrap().push_back(Scripted::Respond(response));
    }

    pub fn push_error(&self, error: TransportError) {
        self.script.lock().unwrap().push_back(Scripted::Fail(error));
    }

    pub fn push_hang(&self) {
        self.script.lock().unwrap().push_back(Scripted::Hang);
    }

    pub fn attempts(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<WireRequest> {
        self.requests.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.requests.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    /// Decoded body of the `index`th request.
    pub fn request_document(&self, index: usize) -> Document {
        let requests = self.requests.lock().unwrap();
        let body = requests[index].0.body.as_ref().expect("request had no body");
        JsonCodec.decode(body).unwrap()
    }
}

impl Transport for ScriptedTransport {
    fn execute<'a>(
        &'a self,
        request: &'a WireRequest,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<WireResponse, TransportError>> {
        self.requests.lock().unwrap().push((request.clone(), timeout));
        let next = self.script.lock().unwrap().pop_front();

        Box::pin(async move {
            match next {
                Some(Scripted::Respond(response)) => Ok(response),
                Some(Scripted::Fail(error)) => Err(error),
                Some(Scripted::Hang) => {
                    cancel.cancelled().await;
                    Err(TransportError::Cancelled)
                }
                None => Err(TransportError::Connect("script exhausted".to_string())),
            }
        })
    }
}

/// A 200 response carrying `document`.
pub fn json_response(document: &Document) -> WireResponse {
    WireResponse::new(200).with_body(JsonCodec.encode(document).unwrap())
}

pub fn test_policy() -> EnginePolicy {
    let mut policy = EnginePolicy::default();
    policy.wire.retry = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(5));
    policy
}

/// One account (id 1) wired to a scripted transport.
pub struct Harness {
    pub cx: EngineContext,
    pub sink: Arc<RecordingSink>,
    pub transport: Arc<ScriptedTransport>,
    pub executor: Executor,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_policy(test_policy()).await
    }

    pub async fn with_policy(policy: EnginePolicy) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let cx = EngineContext::new(test_store().await, Arc::new(JsonCodec), sink.clone(), policy);
        let transport = Arc::new(ScriptedTransport::new());
        let executor = Executor::new(1, cx.clone(), transport.clone());

        Self {
            cx,
            sink,
            transport,
            executor,
        }
    }

    pub async fn state(&self) -> ProtocolState {
        self.cx
            .store
            .protocol_state(1, &self.cx.policy.protocol_version)
            .await
            .unwrap()
    }
}
