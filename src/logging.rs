use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use colored::*;
use std::panic;
use tracing::{error, info, warn};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::broker::UnaryOutcome;
use crate::continuation::StopReason;
use crate::ingress::InboundRequest;
use crate::redaction::{redact_value, RedactionLevel};
use crate::specs::gemini::GeminiRequest;
use crate::types::RequestId;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Assigns every request an id, exposes it to handlers through the
/// `x-request-id` header and echoes it on the response.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(val) = header.clone() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;
    if let Some(val) = header {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Request id assigned by the middleware, or a fresh one when absent.
pub fn request_id_from(headers: &axum::http::HeaderMap) -> RequestId {
    match headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(id) => RequestId(id.to_string()),
        None => RequestId::new(),
    }
}

pub fn log_request_summary(request: &InboundRequest) {
    let msg_count = request.messages.as_ref().map(Vec::len).unwrap_or(0);
    let attachments: usize = request
        .messages
        .iter()
        .flatten()
        .map(|m| m.images.len() + usize::from(m.audio.is_some()))
        .sum();
    let model = request.model.as_deref().unwrap_or("auto");

    info!(
        target: "flight_recorder",
        "[REQ] Messages: {} | Prompt: {} | Attachments: {} | Model: {} | Mode: {} | Stream: {}",
        msg_count,
        request.prompt.is_some(),
        attachments,
        model,
        request.mode.as_deref().unwrap_or("default"),
        request.stream
    );
}

pub fn log_response_summary(request_id: &RequestId, outcome: &UnaryOutcome) {
    if outcome.stop != StopReason::Complete {
        warn!(
            target: "flight_recorder",
            "{}",
            format!(
                "[CONTINUATION] stopped early ({}) after {} chunks",
                outcome.stop.as_str(),
                outcome.chunks
            )
            .yellow()
        );
    }

    let tokens = outcome.usage.map(|u| u.total_tokens).unwrap_or(0);
    info!(
        target: "flight_recorder",
        "[RES] RequestID: {} | Model: {} | Chunks: {} | Text: {} chars | Tokens: {} | Took: {}ms",
        request_id.short(),
        outcome.model,
        outcome.chunks,
        outcome.text.chars().count(),
        tokens,
        outcome.took_ms
    );
}

/// Debug-logs the outbound body with inline media and secrets redacted.
pub fn log_upstream_request(model: &str, streaming: bool, body: &GeminiRequest) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let mut value = match serde_json::to_value(body) {
        Ok(v) => v,
        Err(_) => return,
    };
    redact_value(&mut value, RedactionLevel::default());
    tracing::debug!(
        "[⚙️  -> ☁️ ] {} {} request: {}",
        if streaming { "streaming" } else { "unary" },
        model,
        value
    );
}
