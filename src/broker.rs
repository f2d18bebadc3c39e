use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::candidates::ModelPool;
use crate::constants::{DEFAULT_HEARTBEAT_MS, DEFAULT_TIMEOUT_MS, GEMINI_API_KEY_ENV, RELAY_CHANNEL_CAPACITY};
use crate::continuation::{ContinuationLoop, MarkerHeuristic, StopReason, TruncationPredicate};
use crate::engine::{NormalizedConversation, ParleyEngine};
use crate::fallback::{CallPlan, FallbackController, Streaming, Unary};
use crate::hardening::RetryPolicy;
use crate::ingress::{InboundRequest, RequestOptions};
use crate::json_repair::extract_json;
use crate::language::Lang;
use crate::streaming::{RelayEvent, StreamRelay};
use crate::transport::Transport;
use crate::types::*;

/// Final answer of a non-streaming request.
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryOutcome {
    pub text: String,
    pub model: String,
    pub lang: Lang,
    pub chunks: u32,
    pub stop: StopReason,
    pub usage: Option<Usage>,
    pub took_ms: u64,
    pub structured: bool,
}

impl UnaryOutcome {
    /// Response body. Structured answers carry the extracted JSON value as `text`.
    pub fn to_body(&self, request_id: &RequestId) -> serde_json::Value {
        let mut body = json!({
            "text": self.text,
            "model": self.model,
            "lang": self.lang,
            "requestId": request_id.as_str(),
            "took_ms": self.took_ms,
            "chunks": self.chunks,
        });
        if let Some(usage) = &self.usage {
            body["usage"] = json!({
                "promptTokens": usage.prompt_tokens,
                "completionTokens": usage.completion_tokens,
                "totalTokens": usage.total_tokens,
            });
        }
        if self.structured {
            match extract_json(&self.text) {
                Some(value) => body["text"] = value,
                None => {
                    tracing::warn!("[⚙️] Structured answer from {} did not contain JSON", self.model);
                    body["extraction"] = json!("failed");
                }
            }
        }
        body
    }
}

/// Live relay for a streaming request; the first event is always `Meta`.
pub struct StreamSession {
    pub model: String,
    pub events: mpsc::Receiver<RelayEvent>,
}

/// Composes normalization, candidate selection, fallback, continuation and relay.
pub struct Broker {
    transport: Arc<dyn Transport>,
    pool: ModelPool,
    retry: RetryPolicy,
    heartbeat: Duration,
    default_timeout: Duration,
    predicate: Arc<dyn TruncationPredicate>,
}

impl Broker {
    pub fn new(transport: Arc<dyn Transport>, pool: ModelPool) -> Self {
        Self {
            transport,
            pool,
            retry: RetryPolicy::default(),
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            predicate: Arc::new(MarkerHeuristic),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_truncation_predicate(mut self, predicate: Arc<dyn TruncationPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    pub fn is_configured(&self) -> bool {
        self.transport.is_configured()
    }

    pub fn options(&self, request: &InboundRequest) -> RequestOptions {
        request.options(self.default_timeout)
    }

    fn prepare(
        &self,
        request_id: RequestId,
        request: &InboundRequest,
    ) -> Result<(RequestOptions, NormalizedConversation, RequestContext)> {
        if !self.is_configured() {
            return Err(ParleyError::Configuration(format!(
                "{} is not set; the upstream API cannot be called",
                GEMINI_API_KEY_ENV
            ))
            .into());
        }
        let options = self.options(request);
        let conversation = ParleyEngine::normalize(request, &options);
        let ctx = RequestContext::new(request_id, options.timeout);
        Ok((options, conversation, ctx))
    }

    pub async fn generate(
        &self,
        request_id: RequestId,
        request: &InboundRequest,
    ) -> Result<UnaryOutcome> {
        let (options, conversation, ctx) = self.prepare(request_id, request)?;
        let candidates = self.pool.candidates(&options.model);
        let plan = CallPlan {
            turns: &conversation.turns,
            prefs: options.preferences(),
            guard_level: options.guard_level,
            include_raw: options.include_raw,
        };

        let controller = FallbackController::new(self.transport.as_ref(), self.retry);
        let (model, first) = controller
            .run(&Unary, &ctx, &candidates, &plan)
            .await
            .map_err(ParleyError::Upstream)?;

        let continuation =
            ContinuationLoop::new(&controller, self.predicate.as_ref(), options.max_chunks);
        let report = continuation
            .run(&ctx, &model, &plan, conversation.lang, first)
            .await;

        Ok(UnaryOutcome {
            text: report.text,
            model,
            lang: conversation.lang,
            chunks: report.chunks,
            stop: report.stop,
            usage: report.usage,
            took_ms: ctx.elapsed_ms(),
            structured: plan.prefs.wants_json(),
        })
    }

    /// Opens an upstream stream on the first candidate that accepts one and
    /// spawns the relay. Fails before any event is produced when every candidate fails.
    pub async fn open_stream(
        &self,
        request_id: RequestId,
        request: &InboundRequest,
    ) -> Result<StreamSession> {
        let (options, conversation, ctx) = self.prepare(request_id, request)?;
        let candidates = self.pool.candidates(&options.model);
        let plan = CallPlan {
            turns: &conversation.turns,
            prefs: options.preferences(),
            guard_level: options.guard_level,
            include_raw: options.include_raw,
        };

        let controller = FallbackController::new(self.transport.as_ref(), self.retry);
        let (model, source) = controller
            .run(&Streaming, &ctx, &candidates, &plan)
            .await
            .map_err(ParleyError::Upstream)?;

        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let relay = StreamRelay::new(self.heartbeat);
        let relay_model = model.clone();
        let lang = conversation.lang;
        let stream_span = tracing::info_span!(
            "stream",
            rid = %ctx.request_id.short(),
            model = %relay_model
        );
        tokio::spawn(
            async move {
                relay.run(source, ctx, relay_model, lang, tx).await;
            }
            .instrument(stream_span),
        );

        Ok(StreamSession { model, events: rx })
    }
}
