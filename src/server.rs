use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{sse::KeepAlive, IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

use crate::health;
use crate::ingress::InboundRequest;
use crate::logging::{
    log_request_summary, log_response_summary, request_id_from, request_id_middleware,
    REQUEST_ID_HEADER,
};
use crate::types::{ErrorResponse, RequestId};
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let max_body_size = state.max_body_size;
    Router::new()
        .route("/", post(generate_handler).options(preflight))
        .route("/api/generate", post(generate_handler).options(preflight))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(middleware::from_fn(cors_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Permissive CORS headers on every response, preflight included.
pub async fn cors_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, authorization, x-request-id"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(REQUEST_ID_HEADER),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

#[tracing::instrument(
    name = "parley.request",
    skip_all,
    fields(
        request_id = tracing::field::Empty,
        model.target = tracing::field::Empty,
        http.status = tracing::field::Empty,
        broker.outcome = tracing::field::Empty,
    )
)]
async fn generate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = tracing::Span::current();
    let request_id = request_id_from(&headers);
    span.record("request_id", request_id.as_str());

    let request = match InboundRequest::parse(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("[🖱️  -> ⚙️ ] Rejected request: {}", e.inner);
            span.record("broker.outcome", "client_error");
            return fail(&span, ErrorResponse::new(e, request_id));
        }
    };
    log_request_summary(&request);

    if request.stream {
        return stream_response(&state, &span, request_id, &request).await;
    }

    match state.broker.generate(request_id.clone(), &request).await {
        Ok(outcome) => {
            span.record("model.target", outcome.model.as_str());
            span.record("broker.outcome", "success");
            span.record("http.status", 200);
            log_response_summary(&request_id, &outcome);
            Json(outcome.to_body(&request_id)).into_response()
        }
        Err(e) => {
            span.record("broker.outcome", "upstream_error");
            fail(&span, ErrorResponse::new(e, request_id))
        }
    }
}

async fn stream_response(
    state: &AppState,
    span: &tracing::Span,
    request_id: RequestId,
    request: &InboundRequest,
) -> Response {
    match state.broker.open_stream(request_id.clone(), request).await {
        Ok(session) => {
            span.record("model.target", session.model.as_str());
            span.record("broker.outcome", "streaming");
            span.record("http.status", 200);
            tracing::info!(
                "[☁️  -> 🖱️ ] Streaming {} for request {}",
                session.model,
                request_id.short()
            );
            let events = ReceiverStream::new(session.events)
                .map(|event| Ok::<_, Infallible>(event.to_sse()));
            Sse::new(events)
                .keep_alive(
                    KeepAlive::new()
                        .interval(Duration::from_secs(15))
                        .text("keepalive"),
                )
                .into_response()
        }
        Err(e) => {
            span.record("broker.outcome", "upstream_error");
            fail(span, ErrorResponse::new(e, request_id))
        }
    }
}

fn fail(span: &tracing::Span, error: ErrorResponse) -> Response {
    span.record("http.status", error.error.inner.status_code().as_u16());
    error.into_response()
}
