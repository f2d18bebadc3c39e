use axum::response::sse::Event;
use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

use crate::constants::MAX_STREAM_LINE_BYTES;
use crate::language::Lang;
use crate::transport::ByteStream;
use crate::types::RequestContext;

/// What the relay emits to the client, in order: `Meta`, then `Chunk`/`Ping`, then one `End`.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Meta {
        request_id: String,
        model: String,
        lang: Lang,
    },
    Chunk {
        data: String,
    },
    Ping {
        elapsed_ms: u64,
    },
    End {
        model: String,
        took_ms: u64,
        error: Option<String>,
    },
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Meta { .. } => "meta",
            RelayEvent::Chunk { .. } => "chunk",
            RelayEvent::Ping { .. } => "ping",
            RelayEvent::End { .. } => "end",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            RelayEvent::Meta {
                request_id,
                model,
                lang,
            } => json!({ "requestId": request_id, "model": model, "lang": lang }),
            RelayEvent::Chunk { data } => json!({ "data": data }),
            RelayEvent::Ping { elapsed_ms } => json!({ "elapsedMs": elapsed_ms }),
            RelayEvent::End {
                model,
                took_ms,
                error,
            } => {
                let mut body = json!({ "model": model, "tookMs": took_ms });
                if let Some(err) = error {
                    body["error"] = json!(err);
                }
                body
            }
        }
    }

    pub fn to_sse(&self) -> Event {
        Event::default()
            .event(self.name())
            .data(self.payload().to_string())
    }
}

#[derive(Debug, Default)]
struct RelayStats {
    chunks: usize,
    chars: usize,
    pings: usize,
}

pub struct StreamRelay {
    heartbeat: Duration,
}

impl StreamRelay {
    pub fn new(heartbeat: Duration) -> Self {
        Self { heartbeat }
    }

    /// Reads `source` line by line and forwards events to `tx` until the source
    /// closes, fails, the deadline passes, or the receiver goes away.
    pub async fn run(
        &self,
        source: ByteStream,
        ctx: RequestContext,
        model: String,
        lang: Lang,
        tx: mpsc::Sender<RelayEvent>,
    ) {
        let meta = RelayEvent::Meta {
            request_id: ctx.request_id.to_string(),
            model: model.clone(),
            lang,
        };
        if tx.send(meta).await.is_err() {
            return;
        }

        let mut lines = FramedRead::new(
            StreamReader::new(source),
            LinesCodec::new_with_max_length(MAX_STREAM_LINE_BYTES),
        );
        let mut stats = RelayStats::default();

        let error = loop {
            let remaining = ctx.remaining();
            if remaining.is_zero() {
                break Some("request deadline exceeded".to_string());
            }

            let next = tokio::time::timeout(self.heartbeat.min(remaining), lines.next()).await;
            let event = match next {
                Err(_) => {
                    if ctx.is_expired() {
                        break Some("request deadline exceeded".to_string());
                    }
                    stats.pings += 1;
                    RelayEvent::Ping {
                        elapsed_ms: ctx.elapsed_ms(),
                    }
                }
                Ok(None) => break None,
                Ok(Some(Ok(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    stats.chunks += 1;
                    stats.chars += line.len();
                    RelayEvent::Chunk { data: line }
                }
                Ok(Some(Err(e))) => break Some(describe_line_error(e)),
            };

            if tx.send(event).await.is_err() {
                tracing::debug!("[☁️  -> ⚙️ ] Client went away; dropping upstream stream");
                return;
            }
        };

        match &error {
            Some(err) => tracing::warn!(
                "[☁️  -> ⚙️ ] Stream from {} ended early: {} ({} chunks)",
                model,
                err,
                stats.chunks
            ),
            None => tracing::info!(
                target: "flight_recorder",
                "[STREAM END] RequestID: {} | Model: {} | Chunks: {} | Text: {} chars | Pings: {}",
                ctx.request_id.short(),
                model,
                stats.chunks,
                stats.chars,
                stats.pings
            ),
        }

        let _ = tx
            .send(RelayEvent::End {
                model,
                took_ms: ctx.elapsed_ms(),
                error,
            })
            .await;
    }
}

fn describe_line_error(e: LinesCodecError) -> String {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            format!("upstream line exceeded {} bytes", MAX_STREAM_LINE_BYTES)
        }
        LinesCodecError::Io(io) => format!("upstream stream failed: {}", io),
    }
}
