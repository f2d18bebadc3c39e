use async_trait::async_trait;

use crate::candidates::CandidateList;
use crate::hardening::RetryPolicy;
use crate::transport::{AttemptRequest, ByteStream, Transport};
use crate::types::*;

/// Everything about a call except the model and its time budget.
#[derive(Debug, Clone, Copy)]
pub struct CallPlan<'a> {
    pub turns: &'a [ConversationTurn],
    pub prefs: GenerationPreferences,
    pub guard_level: GuardLevel,
    pub include_raw: bool,
}

impl<'a> CallPlan<'a> {
    fn request(&self, model: &'a str, budget: std::time::Duration) -> AttemptRequest<'a> {
        AttemptRequest {
            model,
            turns: self.turns,
            prefs: self.prefs,
            guard_level: self.guard_level,
            include_raw: self.include_raw,
            budget,
        }
    }

    fn strict(&self) -> Self {
        Self {
            prefs: self.prefs.strict(),
            ..*self
        }
    }
}

/// Unary or streaming call shape.
#[async_trait]
pub trait CallShape: Sync {
    type Output: Send;
    const NAME: &'static str;

    async fn call(
        &self,
        transport: &dyn Transport,
        request: &AttemptRequest<'_>,
    ) -> AttemptOutcome<Self::Output>;
}

pub struct Unary;
pub struct Streaming;

#[async_trait]
impl CallShape for Unary {
    type Output = Generation;
    const NAME: &'static str = "unary";

    async fn call(
        &self,
        transport: &dyn Transport,
        request: &AttemptRequest<'_>,
    ) -> AttemptOutcome<Generation> {
        transport.generate(request).await
    }
}

#[async_trait]
impl CallShape for Streaming {
    type Output = ByteStream;
    const NAME: &'static str = "stream";

    async fn call(
        &self,
        transport: &dyn Transport,
        request: &AttemptRequest<'_>,
    ) -> AttemptOutcome<ByteStream> {
        transport.stream(request).await
    }
}

pub struct FallbackController<'a> {
    transport: &'a dyn Transport,
    retry: RetryPolicy,
}

impl<'a> FallbackController<'a> {
    pub fn new(transport: &'a dyn Transport, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// One candidate through the retry controller.
    pub async fn attempt<S: CallShape>(
        &self,
        shape: &S,
        ctx: &RequestContext,
        model: &str,
        plan: &CallPlan<'_>,
    ) -> AttemptOutcome<S::Output> {
        let transport = self.transport;
        self.retry
            .execute(ctx, model, |attempt, budget| {
                let request = plan.request(model, budget);
                tracing::debug!(
                    "[⚙️  -> ☁️ ] {} {} attempt {} ({}ms left)",
                    S::NAME,
                    model,
                    attempt,
                    budget.as_millis()
                );
                async move { shape.call(transport, &request).await }
            })
            .await
    }

    /// Walks the candidates in order and returns the first success with the model that produced it.
    pub async fn run<S: CallShape>(
        &self,
        shape: &S,
        ctx: &RequestContext,
        candidates: &CandidateList,
        plan: &CallPlan<'_>,
    ) -> std::result::Result<(String, S::Output), UpstreamExhausted> {
        let mut last: Option<(String, UpstreamFailure)> = None;
        let total = candidates.len();

        for (index, model) in candidates.iter().enumerate() {
            if ctx.is_expired() {
                tracing::warn!("[⚙️] Request budget exhausted before trying {}", model);
                break;
            }

            let mut outcome = self.attempt(shape, ctx, model, plan).await;

            if self.wants_strict_recovery(&outcome, plan) && !ctx.is_expired() {
                tracing::info!(
                    "[⚙️] {} returned an empty/blocked answer; retrying once with strict preferences",
                    model
                );
                let strict = plan.strict();
                let request = strict.request(model, ctx.remaining());
                outcome = shape.call(self.transport, &request).await;
            }

            let failure = match outcome {
                AttemptOutcome::Success(value) => {
                    if index > 0 {
                        tracing::info!("[⚙️] Fallback succeeded on candidate {} ({})", index + 1, model);
                    }
                    return Ok((model.to_string(), value));
                }
                AttemptOutcome::Retryable(f) | AttemptOutcome::Terminal(f) => f,
            };

            if index + 1 < total {
                tracing::warn!(
                    "[⚙️] Candidate {} failed ({}); falling back to next model",
                    model,
                    failure
                );
            } else {
                tracing::warn!("[⚙️] Last candidate {} failed ({})", model, failure);
            }
            last = Some((model.to_string(), failure));
        }

        let (model, failure) = last.unwrap_or_else(|| {
            (
                candidates.first().to_string(),
                UpstreamFailure::budget_exhausted(),
            )
        });
        Err(UpstreamExhausted {
            model,
            request_id: ctx.request_id.clone(),
            failure,
        })
    }

    fn wants_strict_recovery<T>(&self, outcome: &AttemptOutcome<T>, plan: &CallPlan<'_>) -> bool {
        plan.prefs.wants_json()
            && matches!(
                outcome,
                AttemptOutcome::Terminal(UpstreamFailure {
                    class: FailureClass::EmptyOrBlocked,
                    ..
                })
            )
    }
}
