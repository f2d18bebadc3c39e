use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

use crate::constants::{
    GEMINI_API_KEY_HEADER, RAW_BODY_SNIPPET_CHARS, RETRYABLE_STATUS_CODES,
};
use crate::redaction::redact_raw_body;
use crate::specs::gemini::{GeminiErrorEnvelope, GeminiRequest, GeminiResponse};
use crate::str_utils::truncate_with_marker;
use crate::types::*;

/// Raw upstream body of a streaming call, unframed.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// One network call's worth of input.
#[derive(Debug, Clone)]
pub struct AttemptRequest<'a> {
    pub model: &'a str,
    pub turns: &'a [ConversationTurn],
    pub prefs: GenerationPreferences,
    pub guard_level: GuardLevel,
    pub include_raw: bool,
    pub budget: Duration,
}

/// Performs exactly one upstream call per invocation and never retries.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn generate(&self, call: &AttemptRequest<'_>) -> AttemptOutcome<Generation>;

    async fn stream(&self, call: &AttemptRequest<'_>) -> AttemptOutcome<ByteStream>;

    /// Whether a credential is available.
    fn is_configured(&self) -> bool;
}

pub struct GeminiTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GeminiTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn endpoint(&self, model: &str, streaming: bool) -> String {
        if streaming {
            format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, model)
        } else {
            format!("{}/models/{}:generateContent", self.base_url, model)
        }
    }

    async fn send(
        &self,
        call: &AttemptRequest<'_>,
        streaming: bool,
    ) -> std::result::Result<reqwest::Response, UpstreamFailure> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(UpstreamFailure::new(
                FailureClass::Rejected,
                "upstream credential is not configured",
            ));
        };

        let body = GeminiRequest::project(call.turns, &call.prefs, call.guard_level);
        crate::logging::log_upstream_request(call.model, streaming, &body);

        let request = self
            .client
            .post(self.endpoint(call.model, streaming))
            .header(GEMINI_API_KEY_HEADER, api_key)
            .json(&body)
            .send();

        match tokio::time::timeout(call.budget, request).await {
            Err(_) => Err(UpstreamFailure::timeout(call.budget)),
            Ok(Err(e)) if e.is_timeout() => Err(UpstreamFailure::new(
                FailureClass::Timeout,
                format!("upstream request timed out: {}", e),
            )),
            Ok(Err(e)) => Err(UpstreamFailure::new(
                FailureClass::Network,
                format!("upstream request failed: {}", e),
            )),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

#[async_trait]
impl Transport for GeminiTransport {
    async fn generate(&self, call: &AttemptRequest<'_>) -> AttemptOutcome<Generation> {
        let started = tokio::time::Instant::now();
        let response = match self.send(call, false).await {
            Ok(r) => r,
            Err(failure) => return outcome_for(failure),
        };

        let status = response.status();
        let body = match read_body(response, call.budget, started).await {
            Ok(body) => body,
            Err(failure) => return AttemptOutcome::Retryable(failure),
        };

        if !status.is_success() {
            return classify_status(status.as_u16(), &body, call.include_raw);
        }

        interpret_body(&body, call.include_raw)
    }

    async fn stream(&self, call: &AttemptRequest<'_>) -> AttemptOutcome<ByteStream> {
        let started = tokio::time::Instant::now();
        let response = match self.send(call, true).await {
            Ok(r) => r,
            Err(failure) => return outcome_for(failure),
        };

        let status = response.status();
        if !status.is_success() {
            let body = match read_body(response, call.budget, started).await {
                Ok(body) => body,
                Err(failure) => return AttemptOutcome::Retryable(failure),
            };
            return classify_status(status.as_u16(), &body, call.include_raw);
        }

        let bytes = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        AttemptOutcome::Success(Box::pin(bytes))
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Reads the whole body within what is left of the attempt budget.
async fn read_body(
    response: reqwest::Response,
    budget: Duration,
    started: tokio::time::Instant,
) -> std::result::Result<String, UpstreamFailure> {
    let remaining = budget.saturating_sub(started.elapsed());
    match tokio::time::timeout(remaining, response.text()).await {
        Err(_) => Err(UpstreamFailure::timeout(budget)),
        Ok(Err(e)) => Err(UpstreamFailure::new(
            FailureClass::Network,
            format!("failed to read upstream body: {}", e),
        )),
        Ok(Ok(body)) => Ok(body),
    }
}

fn outcome_for<T>(failure: UpstreamFailure) -> AttemptOutcome<T> {
    match failure.class {
        FailureClass::Timeout | FailureClass::Network => AttemptOutcome::Retryable(failure),
        _ => AttemptOutcome::Terminal(failure),
    }
}

/// 429 and 5xx are retryable; everything else non-2xx is terminal.
pub fn classify_status<T>(status: u16, body: &str, include_raw: bool) -> AttemptOutcome<T> {
    let message = match serde_json::from_str::<GeminiErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.message.is_empty() => envelope.error.message,
        _ if body.trim().is_empty() => format!("upstream returned status {}", status),
        _ => truncate_with_marker(body.trim(), 300),
    };

    let class = match status {
        429 => FailureClass::RateLimited,
        s if s >= 500 => FailureClass::Server,
        _ => FailureClass::Rejected,
    };

    let mut failure = UpstreamFailure::new(class, message).with_status(status);
    if include_raw {
        failure.raw = Some(raw_snippet(body));
    }

    if RETRYABLE_STATUS_CODES.contains(&status) || (500..600).contains(&status) {
        AttemptOutcome::Retryable(failure)
    } else {
        AttemptOutcome::Terminal(failure)
    }
}

/// Turns a 2xx unary body into a generation, or an empty/blocked/decode failure.
pub fn interpret_body(body: &str, include_raw: bool) -> AttemptOutcome<Generation> {
    let parsed: GeminiResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(e) => {
            let mut failure = UpstreamFailure::new(
                FailureClass::Decode,
                format!("upstream body is not a generateContent response: {}", e),
            );
            if include_raw {
                failure.raw = Some(raw_snippet(body));
            }
            return AttemptOutcome::Terminal(failure);
        }
    };

    let text = parsed.first_text();
    if text.is_empty() || parsed.block_reason().is_some() {
        let message = match (parsed.block_reason(), parsed.finish_reason()) {
            (Some(reason), _) => format!("prompt blocked by upstream: {}", reason),
            (None, Some("SAFETY")) => "response withheld by upstream safety filters".to_string(),
            (None, Some(reason)) => format!("upstream returned no text (finish reason {})", reason),
            (None, None) => "upstream returned no text".to_string(),
        };
        let mut failure = UpstreamFailure::new(FailureClass::EmptyOrBlocked, message);
        failure.safety = parsed.safety_metadata();
        if include_raw {
            failure.raw = Some(raw_snippet(body));
        }
        return AttemptOutcome::Terminal(failure);
    }

    AttemptOutcome::Success(Generation {
        text,
        usage: parsed.usage(),
    })
}

fn raw_snippet(body: &str) -> String {
    truncate_with_marker(&redact_raw_body(body), RAW_BODY_SNIPPET_CHARS)
}
