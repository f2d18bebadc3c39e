use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing_error::SpanTrace;

use crate::constants::{CANDIDATE_COUNT, HARD_CAP_OUTPUT_TOKENS};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::short_id(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// --- CONVERSATION ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Unknown roles coerce to `User`. "model" is accepted as the upstream name for assistant.
    pub fn from_loose(raw: Option<&str>) -> Self {
        match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
            Some("assistant") | Some("model") => Role::Assistant,
            Some("system") => Role::System,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    Attachment { mime_type: String, data: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub segments: Vec<Segment>,
}

impl ConversationTurn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            segments: vec![Segment::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// All text segments joined with newlines.
    pub fn joined_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Text { text } => Some(text.as_str()),
                Segment::Attachment { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn attachment_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Attachment { .. }))
            .count()
    }
}

/// --- GENERATION PREFERENCES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Default,
    Qa,
    Plan,
    ImageBrief,
}

impl Mode {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|m| m.trim().to_ascii_lowercase()).as_deref() {
            Some("qa") => Mode::Qa,
            Some("plan") => Mode::Plan,
            Some("image_brief") => Mode::ImageBrief,
            _ => Mode::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Default => "default",
            Mode::Qa => "qa",
            Mode::Plan => "plan",
            Mode::ImageBrief => "image_brief",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GuardLevel {
    #[default]
    Strict,
    Relaxed,
}

impl GuardLevel {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|m| m.trim().to_ascii_lowercase()).as_deref() {
            Some("relaxed") => GuardLevel::Relaxed,
            _ => GuardLevel::Strict,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GenerationPreferences {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
    pub candidate_count: u32,
    pub output_format: OutputFormat,
}

impl GenerationPreferences {
    pub fn for_request(mode: Mode, long: bool, expect_json: bool) -> Self {
        let (temperature, top_p, max_output_tokens, output_format) = match mode {
            Mode::Default => (0.7, 0.95, 2048, OutputFormat::Plain),
            Mode::Qa => (0.3, 0.9, 2048, OutputFormat::Json),
            Mode::Plan => (0.4, 0.9, 4096, OutputFormat::Json),
            Mode::ImageBrief => (0.6, 0.95, 1024, OutputFormat::Plain),
        };
        let output_format = if expect_json {
            OutputFormat::Json
        } else {
            output_format
        };
        let max_output_tokens = if long {
            HARD_CAP_OUTPUT_TOKENS
        } else {
            max_output_tokens
        };
        Self {
            temperature,
            top_p,
            max_output_tokens: max_output_tokens.clamp(1, HARD_CAP_OUTPUT_TOKENS),
            candidate_count: CANDIDATE_COUNT,
            output_format,
        }
    }

    /// Lower-randomness variant used once per candidate after an empty/blocked answer.
    pub fn strict(&self) -> Self {
        Self {
            temperature: self.temperature.min(0.1),
            top_p: self.top_p.min(0.5),
            ..*self
        }
    }

    pub fn wants_json(&self) -> bool {
        self.output_format == OutputFormat::Json
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn absorb(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// --- REQUEST CONTEXT ---

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub started_at: Instant,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(request_id: RequestId, budget: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            request_id,
            started_at,
            deadline: started_at + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    /// Caps `wait` to what is left of the budget; `None` once the budget is gone.
    pub fn cap_wait(&self, wait: Duration) -> Option<Duration> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            None
        } else {
            Some(wait.min(remaining))
        }
    }
}

/// --- ATTEMPT OUTCOMES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RateLimited,
    Server,
    Timeout,
    Network,
    Rejected,
    EmptyOrBlocked,
    Decode,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Server => "server",
            FailureClass::Timeout => "timeout",
            FailureClass::Network => "network",
            FailureClass::Rejected => "rejected",
            FailureClass::EmptyOrBlocked => "empty/blocked",
            FailureClass::Decode => "decode",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamFailure {
    pub class: FailureClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety: Option<serde_json::Value>,
}

impl UpstreamFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            status: None,
            message: message.into(),
            raw: None,
            safety: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn timeout(budget: Duration) -> Self {
        Self::new(
            FailureClass::Timeout,
            format!("upstream call exceeded its {}ms budget", budget.as_millis()),
        )
    }

    pub fn budget_exhausted() -> Self {
        Self::new(FailureClass::Timeout, "request time budget exhausted")
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {}): {}", self.class, status, self.message),
            None => write!(f, "{}: {}", self.class, self.message),
        }
    }
}

/// Result of exactly one transport call.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    Retryable(UpstreamFailure),
    Terminal(UpstreamFailure),
}

impl<T> AttemptOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success(_))
    }

    pub fn failure(&self) -> Option<&UpstreamFailure> {
        match self {
            AttemptOutcome::Success(_) => None,
            AttemptOutcome::Retryable(f) | AttemptOutcome::Terminal(f) => Some(f),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success(_) => "success",
            AttemptOutcome::Retryable(_) => "retryable",
            AttemptOutcome::Terminal(_) => "terminal",
        }
    }
}

/// Successful unary generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: Option<Usage>,
}

/// Every candidate failed; names the last model tried.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamExhausted {
    pub model: String,
    pub request_id: RequestId,
    pub failure: UpstreamFailure,
}

impl fmt::Display for UpstreamExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "all candidates failed (last model {}, request {}): {}",
            self.model, self.request_id, self.failure
        )
    }
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream error: {0}")]
    Upstream(UpstreamExhausted),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParleyError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            ParleyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ParleyError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ParleyError::Upstream(exhausted) => upstream_status(exhausted.failure.status),
            ParleyError::Network(_) => StatusCode::BAD_GATEWAY,
            ParleyError::Serialization(_) | ParleyError::Io(_) | ParleyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// 429 passes through, 5xx collapses to 502, other upstream statuses pass through,
/// failures without a status (timeout, network, empty) become 502.
pub fn upstream_status(status: Option<u16>) -> axum::http::StatusCode {
    use axum::http::StatusCode;
    match status {
        Some(429) => StatusCode::TOO_MANY_REQUESTS,
        Some(s) if (500..600).contains(&s) => StatusCode::BAD_GATEWAY,
        Some(s) => match StatusCode::from_u16(s) {
            Ok(code) if code.is_client_error() => code,
            _ => StatusCode::BAD_GATEWAY,
        },
        None => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ParleyError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ParleyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// Error body returned to callers. The span trace stays in the logs.
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: ObservedError,
    pub request_id: RequestId,
}

impl ErrorResponse {
    pub fn new(error: impl Into<ObservedError>, request_id: RequestId) -> Self {
        Self {
            error: error.into(),
            request_id,
        }
    }

    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.error.inner.to_string(),
            "requestId": self.request_id.as_str(),
        });
        if let ParleyError::Upstream(exhausted) = &self.error.inner {
            body["error"] = serde_json::json!(format!(
                "all models failed; last tried {}",
                exhausted.model
            ));
            body["modelTried"] = serde_json::json!(exhausted.model);
            let mut upstream = serde_json::json!({
                "status": exhausted.failure.status,
                "message": exhausted.failure.message,
                "class": exhausted.failure.class,
            });
            // only captured when the caller opted into raw diagnostics
            if let Some(raw) = &exhausted.failure.raw {
                upstream["raw"] = serde_json::json!(raw);
            }
            if let Some(safety) = &exhausted.failure.safety {
                upstream["safety"] = safety.clone();
            }
            body["upstream"] = upstream;
        }
        body
    }
}

impl axum::response::IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        let status = self.error.inner.status_code();
        tracing::error!(
            request_id = %self.request_id,
            status = status.as_u16(),
            "Request failed: {}",
            self.error
        );
        (status, axum::Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn unknown_roles_coerce_to_user() {
        assert_eq!(Role::from_loose(Some("assistant")), Role::Assistant);
        assert_eq!(Role::from_loose(Some("MODEL")), Role::Assistant);
        assert_eq!(Role::from_loose(Some("system")), Role::System);
        assert_eq!(Role::from_loose(Some("tool")), Role::User);
        assert_eq!(Role::from_loose(None), Role::User);
    }

    #[test]
    fn preferences_follow_mode_and_flags() {
        let plan = GenerationPreferences::for_request(Mode::Plan, false, false);
        assert!(plan.wants_json());
        assert_eq!(plan.candidate_count, 1);

        let default = GenerationPreferences::for_request(Mode::Default, true, false);
        assert!(!default.wants_json());
        assert_eq!(default.max_output_tokens, HARD_CAP_OUTPUT_TOKENS);

        let forced = GenerationPreferences::for_request(Mode::Default, false, true);
        assert!(forced.wants_json());
    }

    #[test]
    fn strict_preferences_lower_randomness_only() {
        let prefs = GenerationPreferences::for_request(Mode::Qa, false, false);
        let strict = prefs.strict();
        assert!(strict.temperature < prefs.temperature);
        assert!(strict.top_p < prefs.top_p);
        assert_eq!(strict.max_output_tokens, prefs.max_output_tokens);
        assert_eq!(strict.output_format, prefs.output_format);
    }

    #[test]
    fn upstream_status_mapping() {
        assert_eq!(upstream_status(Some(429)), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(upstream_status(Some(503)), StatusCode::BAD_GATEWAY);
        assert_eq!(upstream_status(Some(403)), StatusCode::FORBIDDEN);
        assert_eq!(upstream_status(None), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_body_names_model_and_request() {
        let failure = UpstreamFailure::new(FailureClass::Rejected, "bad key").with_status(403);
        let exhausted = UpstreamExhausted {
            model: "m2".into(),
            request_id: RequestId("rid-1".into()),
            failure,
        };
        let resp = ErrorResponse::new(
            ParleyError::Upstream(exhausted),
            RequestId("rid-1".into()),
        );
        let body = resp.body();
        assert_eq!(body["requestId"], "rid-1");
        assert_eq!(body["modelTried"], "m2");
        assert_eq!(body["upstream"]["status"], 403);
        assert_eq!(body["upstream"]["message"], "bad key");
        assert!(body["upstream"].get("raw").is_none());
    }
}
