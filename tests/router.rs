//! End-to-end routing scenarios against mock providers.

use llm_orchestrator::{
    Error, GenerationParams, HealthStatus, LlmProvider, MockProvider, PricingTable,
    ProviderConfig, Router,
};
use std::sync::Arc;

fn mock(name: &str, model: &str) -> Arc<dyn LlmProvider> {
    Arc::new(MockProvider::new(
        ProviderConfig::new(name).with_model(model),
    ))
}

fn router_with(strategy: &str, models: &[(&str, &str)]) -> Router {
    let mut router = Router::new(strategy).unwrap();
    for (name, model) in models {
        router.add_provider(mock(name, model)).unwrap();
    }
    router
}

#[tokio::test(start_paused = true)]
async fn round_robin_rotates_through_providers() {
    let router = router_with(
        "round-robin",
        &[
            ("p1", "mock-normal"),
            ("p2", "mock-normal"),
            ("p3", "mock-normal"),
        ],
    );

    for prompt in ["Q1", "Q2", "Q3", "Q4"] {
        let response = router.route(prompt, None).await.unwrap();
        assert_eq!(response, format!("Mock response to: {prompt}"));
    }

    // Selection order was p1, p2, p3, p1.
    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].successful_requests, 2);
    assert_eq!(metrics["p2"].successful_requests, 1);
    assert_eq!(metrics["p3"].successful_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn round_robin_fairness_over_many_requests() {
    let router = router_with(
        "round-robin",
        &[
            ("p1", "mock-normal"),
            ("p2", "mock-normal"),
            ("p3", "mock-normal"),
        ],
    );

    let requests = 10u64;
    for i in 0..requests {
        router.route(&format!("prompt {i}"), None).await.unwrap();
    }

    // With N healthy identical providers each gets floor(M/N) or ceil(M/N).
    let metrics = router.get_metrics();
    let total: u64 = metrics.values().map(|m| m.successful_requests).sum();
    assert_eq!(total, requests);
    for snapshot in metrics.values() {
        assert!(snapshot.successful_requests >= requests / 3);
        assert!(snapshot.successful_requests <= requests / 3 + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn fallback_skips_failing_provider() {
    let router = router_with(
        "round-robin",
        &[
            ("p1", "mock-timeout"),
            ("p2", "mock-normal"),
            ("p3", "mock-normal"),
        ],
    );

    let response = router.route("Hi", None).await.unwrap();
    assert_eq!(response, "Mock response to: Hi");

    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].failed_requests, 1);
    assert_eq!(metrics["p1"].successful_requests, 0);
    assert_eq!(metrics["p2"].successful_requests, 1);
    assert_eq!(metrics["p3"].total_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn first_available_skips_unhealthy_without_invoking_them() {
    let router = router_with(
        "first-available",
        &[
            ("p1", "mock-unhealthy"),
            ("p2", "mock-unhealthy"),
            ("p3", "mock-normal"),
        ],
    );

    let response = router.route("check", None).await.unwrap();
    assert_eq!(response, "Mock response to: check");

    // The unhealthy providers were probed, never asked to generate.
    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].total_requests, 0);
    assert_eq!(metrics["p2"].total_requests, 0);
    assert_eq!(metrics["p3"].successful_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn first_available_falls_back_when_nothing_probes_healthy() {
    let router = router_with(
        "first-available",
        &[("p1", "mock-timeout-unhealthy"), ("p2", "mock-normal-unhealthy")],
    );

    // No provider passes the probe, so the walk starts at index 0 and the
    // second provider still serves the request.
    let response = router.route("check", None).await.unwrap();
    assert_eq!(response, "Mock response to: check");

    let metrics = router.get_metrics();
    assert_eq!(metrics["p1"].failed_requests, 1);
    assert_eq!(metrics["p2"].successful_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn all_providers_failing_surfaces_last_error() {
    let router = router_with(
        "round-robin",
        &[
            ("p1", "mock-timeout"),
            ("p2", "mock-timeout"),
            ("p3", "mock-timeout"),
        ],
    );

    let err = router.route("doomed", None).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // One failure per provider, no double-counting.
    let metrics = router.get_metrics();
    for name in ["p1", "p2", "p3"] {
        assert_eq!(metrics[name].failed_requests, 1);
        assert_eq!(metrics[name].total_requests, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn mixed_error_kinds_all_trigger_fallback() {
    for failing_model in ["mock-ratelimit", "mock-auth-error", "mock-invalid-request"] {
        let router = router_with(
            "round-robin",
            &[("bad", failing_model), ("good", "mock-normal")],
        );
        let response = router.route("Hi", None).await.unwrap();
        assert_eq!(response, "Mock response to: Hi");
    }
}

#[tokio::test(start_paused = true)]
async fn only_healthy_provider_serves_all_requests() {
    for strategy in ["round-robin", "random", "first-available", "best-available"] {
        let router = router_with(
            strategy,
            &[
                ("p1", "mock-timeout"),
                ("p2", "mock-normal"),
                ("p3", "mock-ratelimit"),
            ],
        );

        for i in 0..6 {
            let response = router.route(&format!("q{i}"), None).await.unwrap();
            assert_eq!(response, format!("Mock response to: q{i}"));
        }

        let metrics = router.get_metrics();
        assert_eq!(metrics["p2"].successful_requests, 6, "strategy {strategy}");
    }
}

#[tokio::test(start_paused = true)]
async fn counters_stay_consistent_under_mixed_outcomes() {
    let router = router_with(
        "round-robin",
        &[("flaky", "mock-ratelimit"), ("solid", "mock-normal")],
    );

    for i in 0..20 {
        router.route(&format!("req {i}"), None).await.unwrap();
    }

    for (name, snapshot) in router.get_metrics() {
        assert_eq!(
            snapshot.total_requests,
            snapshot.successful_requests + snapshot.failed_requests,
            "provider {name}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn best_available_stops_selecting_unhealthy_provider() {
    let router = router_with(
        "best-available",
        &[("flaky", "mock-ratelimit"), ("solid", "mock-normal")],
    );

    for i in 0..10 {
        router.route(&format!("req {i}"), None).await.unwrap();
    }

    let metrics = router.get_metrics();
    // The failing provider is attempted only while it still looks healthy;
    // once its error rate crosses the threshold the router starts elsewhere.
    assert!(
        metrics["flaky"].total_requests < 10,
        "flaky was attempted {} times",
        metrics["flaky"].total_requests
    );
    assert_eq!(metrics["flaky"].health_status, HealthStatus::Unhealthy);
    assert_eq!(metrics["solid"].successful_requests, 10);
}

#[tokio::test(start_paused = true)]
async fn random_strategy_always_lands_somewhere() {
    let router = router_with(
        "random",
        &[
            ("p1", "mock-normal"),
            ("p2", "mock-normal"),
            ("p3", "mock-normal"),
        ],
    );

    for i in 0..12 {
        router.route(&format!("q{i}"), None).await.unwrap();
    }

    let metrics = router.get_metrics();
    let total: u64 = metrics.values().map(|m| m.successful_requests).sum();
    assert_eq!(total, 12);
}

#[tokio::test(start_paused = true)]
async fn tokens_and_cost_are_accounted_per_request() {
    let pricing = PricingTable::default().with_price("mock", None, 1.0);
    let mut router = Router::new("round-robin").unwrap().with_pricing(pricing);
    router.add_provider(mock("m", "mock-normal")).unwrap();

    router.route("x", None).await.unwrap();

    let prompt_tokens = u64::from(llm_orchestrator::count_tokens("x", "mock-normal"));
    let completion_tokens =
        u64::from(llm_orchestrator::count_tokens("Mock response to: x", "mock-normal"));

    let snapshot = &router.get_metrics()["m"];
    assert_eq!(snapshot.total_prompt_tokens, prompt_tokens);
    assert_eq!(snapshot.total_completion_tokens, completion_tokens);
    assert_eq!(snapshot.total_tokens, prompt_tokens + completion_tokens);

    let expected_cost = (prompt_tokens + completion_tokens) as f64 / 1000.0;
    assert!((snapshot.total_cost_rub - expected_cost).abs() < 1e-9);

    // A second request only grows the totals.
    router.route("x", None).await.unwrap();
    let snapshot = &router.get_metrics()["m"];
    assert_eq!(snapshot.total_prompt_tokens, 2 * prompt_tokens);
    assert!((snapshot.total_cost_rub - 2.0 * expected_cost).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn max_tokens_parameter_reaches_the_provider() {
    let router = router_with("round-robin", &[("p1", "mock-normal")]);
    let params = GenerationParams::default().with_max_tokens(10);
    let response = router.route("Hello, world!", Some(params)).await.unwrap();
    assert_eq!(response, "Mock respo");
}
