#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley::broker::Broker;
use parley::candidates::ModelPool;
use parley::hardening::RetryPolicy;
use parley::transport::{AttemptRequest, ByteStream, Transport};
use parley::types::*;

/// One recorded transport invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub streaming: bool,
    pub temperature: f32,
    pub turns: Vec<ConversationTurn>,
}

/// Scripted streaming outcome: either a body delivered piece by piece after
/// the given delays, or a failure before the stream opens.
pub enum StreamScript {
    Open(Vec<(Duration, &'static str)>),
    Fail(AttemptOutcome<()>),
}

/// Transport double that replays per-model outcome queues and records every call.
#[derive(Default)]
pub struct ScriptedTransport {
    unary: Mutex<HashMap<String, VecDeque<AttemptOutcome<Generation>>>>,
    streams: Mutex<HashMap<String, VecDeque<StreamScript>>>,
    calls: Mutex<Vec<RecordedCall>>,
    unconfigured: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unconfigured() -> Self {
        Self {
            unconfigured: true,
            ..Self::default()
        }
    }

    pub fn on(self, model: &str, outcome: AttemptOutcome<Generation>) -> Self {
        self.unary
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn on_times(mut self, model: &str, times: usize, make: fn() -> AttemptOutcome<Generation>) -> Self {
        for _ in 0..times {
            self = self.on(model, make());
        }
        self
    }

    pub fn on_stream(self, model: &str, script: StreamScript) -> Self {
        self.streams
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(script);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn models_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.model).collect()
    }

    fn record(&self, call: &AttemptRequest<'_>, streaming: bool) {
        self.calls.lock().unwrap().push(RecordedCall {
            model: call.model.to_string(),
            streaming,
            temperature: call.prefs.temperature,
            turns: call.turns.to_vec(),
        });
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn generate(&self, call: &AttemptRequest<'_>) -> AttemptOutcome<Generation> {
        self.record(call, false);
        let next = self
            .unary
            .lock()
            .unwrap()
            .get_mut(call.model)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| rejected(404, "no scripted outcome"))
    }

    async fn stream(&self, call: &AttemptRequest<'_>) -> AttemptOutcome<ByteStream> {
        self.record(call, true);
        let next = self
            .streams
            .lock()
            .unwrap()
            .get_mut(call.model)
            .and_then(VecDeque::pop_front);
        match next {
            Some(StreamScript::Open(pieces)) => {
                let body = futures_util::stream::iter(pieces).then(|(delay, piece)| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, std::io::Error>(Bytes::from_static(piece.as_bytes()))
                });
                AttemptOutcome::Success(Box::pin(body))
            }
            Some(StreamScript::Fail(AttemptOutcome::Retryable(f))) => AttemptOutcome::Retryable(f),
            Some(StreamScript::Fail(AttemptOutcome::Terminal(f))) => AttemptOutcome::Terminal(f),
            _ => AttemptOutcome::Terminal(UpstreamFailure::new(
                FailureClass::Rejected,
                "no scripted stream",
            )),
        }
    }

    fn is_configured(&self) -> bool {
        !self.unconfigured
    }
}

pub fn ok(text: &str) -> AttemptOutcome<Generation> {
    AttemptOutcome::Success(Generation {
        text: text.to_string(),
        usage: Some(Usage {
            prompt_tokens: 5,
            completion_tokens: 3,
            total_tokens: 8,
        }),
    })
}

pub fn server_error() -> AttemptOutcome<Generation> {
    AttemptOutcome::Retryable(
        UpstreamFailure::new(FailureClass::Server, "internal error").with_status(500),
    )
}

pub fn rate_limited() -> AttemptOutcome<Generation> {
    AttemptOutcome::Retryable(
        UpstreamFailure::new(FailureClass::RateLimited, "quota exceeded").with_status(429),
    )
}

pub fn rejected<T>(status: u16, message: &str) -> AttemptOutcome<T> {
    AttemptOutcome::Terminal(UpstreamFailure::new(FailureClass::Rejected, message).with_status(status))
}

pub fn blocked() -> AttemptOutcome<Generation> {
    AttemptOutcome::Terminal(UpstreamFailure::new(
        FailureClass::EmptyOrBlocked,
        "prompt blocked by upstream: SAFETY",
    ))
}

pub fn pool(models: &[&str]) -> ModelPool {
    ModelPool::new(models.iter().copied()).unwrap()
}

pub fn broker(transport: Arc<ScriptedTransport>, models: &[&str]) -> Broker {
    Broker::new(transport, pool(models)).with_retry(RetryPolicy::new(3, 600))
}

pub fn request(json: serde_json::Value) -> parley::ingress::InboundRequest {
    parley::ingress::InboundRequest::parse(json.to_string().as_bytes()).unwrap()
}
