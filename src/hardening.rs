use std::future::Future;
use std::time::Duration;

use crate::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_MS, RETRY_JITTER_MS};
use crate::types::{AttemptOutcome, RequestContext, UpstreamFailure};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_MS)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            jitter_ms: RETRY_JITTER_MS,
        }
    }

    /// `base * 2^(attempt-1)` plus uniform jitter in `[0, jitter_ms)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base_delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        let jitter = if self.jitter_ms > 0 {
            fastrand::u64(0..self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base_delay.saturating_add(jitter))
    }

    /// Runs `operation` until it succeeds, fails terminally, runs out of tries or
    /// runs out of budget. The closure receives the attempt number and the time
    /// left for that attempt. The last outcome is returned unchanged.
    pub async fn execute<F, Fut, T>(
        &self,
        ctx: &RequestContext,
        model: &str,
        mut operation: F,
    ) -> AttemptOutcome<T>
    where
        F: FnMut(u32, Duration) -> Fut,
        Fut: Future<Output = AttemptOutcome<T>>,
    {
        let mut attempts = 0;
        loop {
            let budget = ctx.remaining();
            if budget.is_zero() {
                return AttemptOutcome::Retryable(UpstreamFailure::budget_exhausted());
            }

            attempts += 1;
            let outcome = operation(attempts, budget).await;
            if attempts >= self.max_attempts || !matches!(outcome, AttemptOutcome::Retryable(_)) {
                return outcome;
            }

            let Some(delay) = ctx.cap_wait(self.backoff_delay(attempts)) else {
                return outcome;
            };
            if let Some(failure) = outcome.failure() {
                tracing::warn!(
                    "[⚙️  -> ☁️ ] {} attempt {} failed: {}. Retrying in {:?} (jittered)...",
                    model,
                    attempts,
                    failure,
                    delay
                );
            }
            tokio::time::sleep(delay).await;
            if ctx.is_expired() {
                return outcome;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureClass, RequestId};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retryable() -> AttemptOutcome<&'static str> {
        AttemptOutcome::Retryable(UpstreamFailure::new(FailureClass::Server, "boom").with_status(500))
    }

    #[test]
    fn backoff_stays_within_bounds() {
        let policy = RetryPolicy::new(3, 600);
        for _ in 0..200 {
            let first = policy.backoff_delay(1).as_millis();
            let second = policy.backoff_delay(2).as_millis();
            assert!((600..1000).contains(&first), "first delay {}", first);
            assert!((1200..1600).contains(&second), "second delay {}", second);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let policy = RetryPolicy::new(3, 600);
        let ctx = RequestContext::new(RequestId::new(), Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let outcome = policy
            .execute(&ctx, "m", |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { retryable() }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(outcome, AttemptOutcome::Retryable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_and_success_are_not_retried() {
        let policy = RetryPolicy::default();
        let ctx = RequestContext::new(RequestId::new(), Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let outcome: AttemptOutcome<&str> = policy
            .execute(&ctx, "m", |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    AttemptOutcome::Terminal(
                        UpstreamFailure::new(FailureClass::Rejected, "nope").with_status(400),
                    )
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, AttemptOutcome::Terminal(_)));

        let outcome = policy
            .execute(&ctx, "m", |attempt, _| async move {
                if attempt == 1 {
                    retryable()
                } else {
                    AttemptOutcome::Success("ok")
                }
            })
            .await;
        assert!(matches!(outcome, AttemptOutcome::Success("ok")));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped_by_budget() {
        let policy = RetryPolicy::new(3, 10_000);
        let ctx = RequestContext::new(RequestId::new(), Duration::from_millis(1_500));
        let calls = AtomicU32::new(0);
        let outcome = policy
            .execute(&ctx, "m", |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { retryable() }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ctx.is_expired());
        assert!(matches!(outcome, AttemptOutcome::Retryable(_)));
    }
}
