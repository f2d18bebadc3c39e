//! Stitches follow-up generations onto an answer that looks cut off.
//!
//! Truncation detection is a heuristic over the tail of the text. Answers that
//! legitimately end in a dash or an ellipsis are a known false-positive class;
//! they cost one extra upstream call, bounded by the chunk cap.

use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;

use crate::constants::{
    CONTINUATION_SAFETY_MARGIN_MS, DEDUPE_WINDOW_CHARS, TRUNCATION_WINDOW_CHARS,
};
use crate::fallback::{CallPlan, FallbackController, Unary};
use crate::language::Lang;
use crate::str_utils::{prefix_chars, suffix_chars};
use crate::types::*;

lazy_static! {
    static ref TRUNCATION_MARKER: Regex = Regex::new(
        r"(?i)(…|\.\.\.|-|\(?\s*(?:to\s+be\s+)?continued\s*\)?|\(?\s*يتبع\s*\)?)\s*$"
    )
    .expect("truncation regex is valid");
}

pub trait TruncationPredicate: Send + Sync {
    fn looks_truncated(&self, tail: &str) -> bool;
}

/// Ends with `…`, `...`, `-`, or a "(to be) continued" / `يتبع` marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerHeuristic;

impl TruncationPredicate for MarkerHeuristic {
    fn looks_truncated(&self, tail: &str) -> bool {
        TRUNCATION_MARKER.is_match(tail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Complete,
    ChunkCap,
    BudgetExhausted,
    UpstreamFailed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Complete => "complete",
            StopReason::ChunkCap => "chunk_cap",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::UpstreamFailed => "upstream_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationReport {
    pub text: String,
    pub chunks: u32,
    pub stop: StopReason,
    pub usage: Option<Usage>,
}

/// Appends `next` to `accumulated`, dropping a repeated lead-in.
pub fn dedupe_continuation(accumulated: &str, next: &str) -> String {
    let head = prefix_chars(next, DEDUPE_WINDOW_CHARS);
    if !head.is_empty() && accumulated.ends_with(head) {
        format!("{}{}", accumulated, &next[head.len()..])
    } else {
        format!("{}\n{}", accumulated, next)
    }
}

pub struct ContinuationLoop<'a> {
    controller: &'a FallbackController<'a>,
    predicate: &'a dyn TruncationPredicate,
    max_chunks: u32,
    safety_margin: Duration,
}

impl<'a> ContinuationLoop<'a> {
    pub fn new(
        controller: &'a FallbackController<'a>,
        predicate: &'a dyn TruncationPredicate,
        max_chunks: u32,
    ) -> Self {
        Self {
            controller,
            predicate,
            max_chunks: max_chunks.max(1),
            safety_margin: Duration::from_millis(CONTINUATION_SAFETY_MARGIN_MS),
        }
    }

    pub async fn run(
        &self,
        ctx: &RequestContext,
        model: &str,
        plan: &CallPlan<'_>,
        lang: Lang,
        first: Generation,
    ) -> ContinuationReport {
        let mut text = first.text;
        let mut usage = first.usage;
        let mut chunks = 1u32;

        let stop = loop {
            if !self
                .predicate
                .looks_truncated(suffix_chars(&text, TRUNCATION_WINDOW_CHARS))
            {
                break StopReason::Complete;
            }
            if chunks >= self.max_chunks {
                break StopReason::ChunkCap;
            }
            if ctx.remaining() <= self.safety_margin {
                break StopReason::BudgetExhausted;
            }

            let mut turns = Vec::with_capacity(plan.turns.len() + 2);
            turns.extend_from_slice(plan.turns);
            turns.push(ConversationTurn::assistant(text.clone()));
            turns.push(ConversationTurn::user(lang.continuation_prompt()));
            let next_plan = CallPlan {
                turns: &turns,
                ..*plan
            };

            tracing::info!(
                "[⚙️] Answer from {} looks truncated; requesting chunk {}",
                model,
                chunks + 1
            );
            match self.controller.attempt(&Unary, ctx, model, &next_plan).await {
                AttemptOutcome::Success(next) => {
                    text = dedupe_continuation(&text, &next.text);
                    usage = match (usage, next.usage) {
                        (Some(mut total), Some(extra)) => {
                            total.absorb(&extra);
                            Some(total)
                        }
                        (total, extra) => total.or(extra),
                    };
                    chunks += 1;
                }
                AttemptOutcome::Retryable(failure) | AttemptOutcome::Terminal(failure) => {
                    tracing::warn!(
                        "[⚙️] Continuation on {} failed ({}); keeping {} chunk(s)",
                        model,
                        failure,
                        chunks
                    );
                    break StopReason::UpstreamFailed;
                }
            }
        };

        tracing::debug!(
            "[⚙️] Continuation finished: {} chunk(s), stop = {}",
            chunks,
            stop.as_str()
        );
        ContinuationReport {
            text,
            chunks,
            stop,
            usage,
        }
    }
}
