mod common;

use common::*;
use parley::candidates::ModelChoice;
use parley::fallback::{CallPlan, FallbackController, Unary};
use parley::hardening::RetryPolicy;
use parley::types::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn plan(turns: &[ConversationTurn], json_output: bool) -> CallPlan<'_> {
    CallPlan {
        turns,
        prefs: GenerationPreferences::for_request(Mode::Default, false, json_output),
        guard_level: GuardLevel::Strict,
        include_raw: false,
    }
}

fn ctx(secs: u64) -> RequestContext {
    RequestContext::new(RequestId("rid-test".into()), Duration::from_secs(secs))
}

#[tokio::test(start_paused = true)]
async fn test_candidates_tried_in_order_until_success() {
    let transport = ScriptedTransport::new()
        .on("a", rejected(400, "bad"))
        .on("b", rejected(403, "denied"))
        .on("c", ok("from c"));
    let controller = FallbackController::new(&transport, RetryPolicy::new(3, 600));
    let candidates = pool(&["a", "b", "c", "d"]).candidates(&ModelChoice::Auto);
    let turns = vec![ConversationTurn::user("hi")];

    let (model, generation) = controller
        .run(&Unary, &ctx(60), &candidates, &plan(&turns, false))
        .await
        .unwrap();

    assert_eq!(model, "c");
    assert_eq!(generation.text, "from c");
    assert_eq!(transport.models_called(), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_use_at_most_three_attempts_per_candidate() {
    let transport = ScriptedTransport::new()
        .on_times("a", 5, server_error)
        .on_times("b", 5, rate_limited);
    let controller = FallbackController::new(&transport, RetryPolicy::new(3, 600));
    let candidates = pool(&["a", "b"]).candidates(&ModelChoice::Auto);
    let turns = vec![ConversationTurn::user("hi")];

    let err = controller
        .run(&Unary, &ctx(120), &candidates, &plan(&turns, false))
        .await
        .unwrap_err();

    assert_eq!(transport.models_called(), vec!["a", "a", "a", "b", "b", "b"]);
    assert_eq!(err.model, "b");
    assert_eq!(err.request_id.as_str(), "rid-test");
    assert_eq!(err.failure.status, Some(429));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_waits_between_attempts() {
    let transport = ScriptedTransport::new()
        .on("a", server_error())
        .on("a", server_error())
        .on("a", ok("third time"));
    let controller = FallbackController::new(&transport, RetryPolicy::new(3, 600));
    let candidates = pool(&["a"]).candidates(&ModelChoice::Auto);
    let turns = vec![ConversationTurn::user("hi")];

    let started = tokio::time::Instant::now();
    let (_, generation) = controller
        .run(&Unary, &ctx(60), &candidates, &plan(&turns, false))
        .await
        .unwrap();
    let waited = started.elapsed();

    assert_eq!(generation.text, "third time");
    // 600 + 1200 ms of base delay plus up to 400 ms jitter per wait
    assert!(waited >= Duration::from_millis(1800), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(2600), "waited {:?}", waited);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_model_is_tried_first() {
    let transport = ScriptedTransport::new()
        .on("b", rejected(404, "unknown model"))
        .on("a", ok("pool answer"));
    let controller = FallbackController::new(&transport, RetryPolicy::default());
    let candidates = pool(&["a", "b"]).candidates(&ModelChoice::Explicit("b".into()));
    let turns = vec![ConversationTurn::user("hi")];

    let (model, _) = controller
        .run(&Unary, &ctx(60), &candidates, &plan(&turns, false))
        .await
        .unwrap();
    assert_eq!(model, "a");
    assert_eq!(transport.models_called(), vec!["b", "a"]);
}

#[tokio::test(start_paused = true)]
async fn test_strict_recovery_once_per_candidate_for_structured_output() {
    let transport = ScriptedTransport::new()
        .on("a", blocked())
        .on("a", blocked())
        .on("b", blocked())
        .on("b", ok("{\"answer\":\"ok\",\"confidence\":1}"));
    let controller = FallbackController::new(&transport, RetryPolicy::default());
    let candidates = pool(&["a", "b"]).candidates(&ModelChoice::Auto);
    let turns = vec![ConversationTurn::user("hi")];

    let (model, _) = controller
        .run(&Unary, &ctx(60), &candidates, &plan(&turns, true))
        .await
        .unwrap();

    assert_eq!(model, "b");
    let calls = transport.calls();
    assert_eq!(calls.len(), 4);
    let normal = GenerationPreferences::for_request(Mode::Default, false, true);
    assert_eq!(calls[0].temperature, normal.temperature);
    assert_eq!(calls[1].temperature, normal.strict().temperature);
    assert_eq!(calls[2].temperature, normal.temperature);
    assert_eq!(calls[3].temperature, normal.strict().temperature);
}

#[tokio::test(start_paused = true)]
async fn test_no_strict_recovery_for_plain_output() {
    let transport = ScriptedTransport::new()
        .on("a", blocked())
        .on("b", ok("plain"));
    let controller = FallbackController::new(&transport, RetryPolicy::default());
    let candidates = pool(&["a", "b"]).candidates(&ModelChoice::Auto);
    let turns = vec![ConversationTurn::user("hi")];

    let (model, _) = controller
        .run(&Unary, &ctx(60), &candidates, &plan(&turns, false))
        .await
        .unwrap();
    assert_eq!(model, "b");
    assert_eq!(transport.models_called(), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_expired_budget_tries_nothing() {
    let transport = ScriptedTransport::new().on("a", ok("never"));
    let controller = FallbackController::new(&transport, RetryPolicy::default());
    let candidates = pool(&["a"]).candidates(&ModelChoice::Auto);
    let turns = vec![ConversationTurn::user("hi")];
    let ctx = RequestContext::new(RequestId::new(), Duration::ZERO);

    let err = controller
        .run(&Unary, &ctx, &candidates, &plan(&turns, false))
        .await
        .unwrap_err();
    assert_eq!(err.model, "a");
    assert_eq!(err.failure.class, FailureClass::Timeout);
    assert!(transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hello_auto_falls_back_after_three_server_errors() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .on_times("p1", 3, server_error)
            .on("p2", ok("hi")),
    );
    let broker = broker(transport.clone(), &["p1", "p2"]);

    let outcome = broker
        .generate(RequestId::new(), &request(json!({"prompt": "hello", "model": "auto"})))
        .await
        .unwrap();

    assert_eq!(outcome.text, "hi");
    assert_eq!(outcome.model, "p2");
    assert_eq!(outcome.chunks, 1);
    assert_eq!(transport.models_called(), vec!["p1", "p1", "p1", "p2"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_surfaces_last_model_and_status() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .on("p1", rejected(400, "bad request"))
            .on("p2", rejected(403, "API key not valid")),
    );
    let broker = broker(transport.clone(), &["p1", "p2"]);
    let rid = RequestId("rid-42".into());

    let err = broker
        .generate(rid.clone(), &request(json!({"prompt": "hello"})))
        .await
        .unwrap_err();

    match &err.inner {
        ParleyError::Upstream(exhausted) => {
            assert_eq!(exhausted.model, "p2");
            assert_eq!(exhausted.failure.status, Some(403));
        }
        other => panic!("Expected upstream error, got {:?}", other),
    }
    let body = ErrorResponse::new(err, rid).body();
    assert_eq!(body["requestId"], "rid-42");
    assert_eq!(body["modelTried"], "p2");
    assert_eq!(body["upstream"]["message"], "API key not valid");
}

#[tokio::test]
async fn test_missing_credential_is_configuration_error() {
    let transport = Arc::new(ScriptedTransport::unconfigured());
    let broker = broker(transport.clone(), &["p1"]);

    let err = broker
        .generate(RequestId::new(), &request(json!({"prompt": "hello"})))
        .await
        .unwrap_err();
    assert!(matches!(err.inner, ParleyError::Configuration(_)));
    assert_eq!(err.inner.status_code().as_u16(), 500);
    assert!(transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_guardrail_reaches_upstream_exactly_once() {
    let transport = Arc::new(ScriptedTransport::new().on("p1", ok("fine")));
    let broker = broker(transport.clone(), &["p1"]);

    broker
        .generate(
            RequestId::new(),
            &request(json!({"messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": "three"}
            ]})),
        )
        .await
        .unwrap();

    let turns = &transport.calls()[0].turns;
    let marked: Vec<_> = turns
        .iter()
        .filter(|t| t.joined_text().contains(parley::guardrails::GUARDRAIL_HEADER))
        .collect();
    assert_eq!(marked.len(), 1);
    assert_eq!(marked[0], &turns[0]);
}
