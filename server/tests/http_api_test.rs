//! HTTP API integration tests.
//!
//! Drive the full router over in-memory backends with `axum-test`.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Integration tests can use expect for setup

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::Duration as ChronoDuration;
use reservation_core::lock::LockKey;
use reservation_core::{PolicyId, ReservationIntent, ReservationRecord};
use reservation_runtime::{CoordinatorConfig, LifecycleConfig, StrategyKind};
use reservation_runtime::metrics::MetricsServer;
use reservation_server::application::metrics_router;
use reservation_server::{AppState, build_router};
use reservation_testing::fixtures::{active_policy, future_policy, request_id};
use reservation_testing::{InMemoryBackends, epoch};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn server_with(env: &InMemoryBackends, config: CoordinatorConfig) -> TestServer {
    let state = AppState::new(env.backends(), config, LifecycleConfig::default()).unwrap();
    TestServer::new(build_router(state)).expect("Failed to build test server")
}

fn server(env: &InMemoryBackends, strategy: StrategyKind) -> TestServer {
    server_with(
        env,
        CoordinatorConfig {
            strategy,
            ..CoordinatorConfig::default()
        },
    )
}

fn reserve_body(policy_id: i64, requester_id: i64, request: &str) -> Value {
    json!({
        "policyId": policy_id,
        "requesterId": requester_id,
        "quantity": 1,
        "requestId": request,
    })
}

fn issued(env: &InMemoryBackends, requester_id: i64, request: &str) -> ReservationRecord {
    let intent = ReservationIntent {
        request_id: request_id(request),
        policy_id: PolicyId::new(1),
        requester_id: reservation_core::RequesterId::new(requester_id),
        quantity: 1,
        submitted_at: epoch(),
    };
    let record = ReservationRecord::issue(&intent, epoch());
    env.ledger.seed(record.clone());
    record
}

#[tokio::test]
async fn health_reports_ok() {
    let env = InMemoryBackends::new();
    let server = server(&env, StrategyKind::AsyncQueue);

    let response = server.get("/health").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "ok");
}

#[tokio::test]
async fn metrics_endpoint_needs_an_installed_recorder() {
    let metrics = MetricsServer::new("127.0.0.1:0".parse().unwrap());
    let server = TestServer::new(metrics_router(Arc::new(metrics))).unwrap();

    server
        .get("/metrics")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn synchronous_admission_returns_the_reservation_id() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let server = server(&env, StrategyKind::LedgerCount);

    let response = server
        .post("/api/reservations")
        .json(&reserve_body(1, 10, "checkout-1"))
        .await;

    response.assert_status(StatusCode::ACCEPTED);
    let body = response.json::<Value>();
    assert_eq!(body["requestId"], "checkout-1");
    assert_eq!(body["replayed"], false);
    let reservation_id = body["reservationId"].as_str().unwrap();
    assert_eq!(env.ledger.records()[0].id.to_string(), reservation_id);
}

#[tokio::test]
async fn asynchronous_admission_is_pending_until_issued() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let server = server(&env, StrategyKind::AsyncQueue);

    let response = server
        .post("/api/reservations")
        .json(&reserve_body(1, 10, "checkout-1"))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body = response.json::<Value>();
    assert!(body.get("reservationId").is_none());
    assert_eq!(env.queue.published().len(), 1);

    let outcome = server.get("/api/outcomes/checkout-1").await;
    outcome.assert_status_ok();
    assert_eq!(outcome.json::<Value>()["status"], "PENDING");
}

#[tokio::test]
async fn retried_request_is_replayed_without_taking_more_units() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let server = server(&env, StrategyKind::CachedCounter);

    for replayed in [false, true] {
        let response = server
            .post("/api/reservations")
            .json(&reserve_body(1, 10, "checkout-1"))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        assert_eq!(response.json::<Value>()["replayed"], replayed);
    }
    assert_eq!(env.counter.value(PolicyId::new(1)), Some(4));
}

#[tokio::test]
async fn exhausted_policy_is_a_conflict() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 1)).await;
    let server = server(&env, StrategyKind::CachedCounter);

    server
        .post("/api/reservations")
        .json(&reserve_body(1, 10, "first"))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let response = server
        .post("/api/reservations")
        .json(&reserve_body(1, 11, "second"))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    assert_eq!(response.json::<Value>()["code"], "EXHAUSTED");
}

#[tokio::test]
async fn rejections_use_their_own_status_codes() {
    let env = InMemoryBackends::new();
    env.activate(future_policy(2, 5)).await;
    let server = server(&env, StrategyKind::AsyncQueue);

    let out_of_window = server
        .post("/api/reservations")
        .json(&reserve_body(2, 10, "early"))
        .await;
    out_of_window.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(out_of_window.json::<Value>()["code"], "OUT_OF_WINDOW");

    let unknown = server
        .post("/api/reservations")
        .json(&reserve_body(404, 10, "nowhere"))
        .await;
    unknown.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(unknown.json::<Value>()["code"], "POLICY_NOT_FOUND");

    let zero = server
        .post("/api/reservations")
        .json(&json!({"policyId": 2, "requesterId": 10, "quantity": 0, "requestId": "zero"}))
        .await;
    zero.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(zero.json::<Value>()["code"], "INVALID_QUANTITY");
}

#[tokio::test]
async fn empty_request_id_is_a_bad_request() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let server = server(&env, StrategyKind::AsyncQueue);

    let response = server
        .post("/api/reservations")
        .json(&reserve_body(1, 10, ""))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(env.counter.value(PolicyId::new(1)), Some(5));
}

#[tokio::test]
async fn busy_lock_asks_the_client_to_retry() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    env.lock
        .hold_elsewhere(&LockKey::for_policy(PolicyId::new(1)), Duration::from_secs(60));
    let server = server_with(
        &env,
        CoordinatorConfig {
            lock_wait: Duration::from_millis(100),
            ..CoordinatorConfig::default()
        },
    );

    let response = server
        .post("/api/reservations")
        .json(&reserve_body(1, 10, "blocked"))
        .await;

    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.json::<Value>()["code"], "LOCK_BUSY");
    assert_eq!(response.header("retry-after"), "1");
    assert_eq!(env.counter.value(PolicyId::new(1)), Some(5));
}

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test]
async fn unknown_outcome_is_not_found() {
    let env = InMemoryBackends::new();
    let server = server(&env, StrategyKind::AsyncQueue);

    let response = server.get("/api/outcomes/never-sent").await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>(), json!({"status": "NOT_FOUND"}));
}

#[tokio::test]
async fn recovery_finds_issued_reservations_and_clears_the_rest() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let record = issued(&env, 10, "lost");
    let server = server(&env, StrategyKind::AsyncQueue);

    let recovered = server
        .post("/api/outcomes/lost/recover")
        .json(&json!({"policyId": 1}))
        .await;
    recovered.assert_status_ok();
    let body = recovered.json::<Value>();
    assert_eq!(body["verdict"], "RECOVERED");
    assert_eq!(body["reservation"]["id"], record.id.to_string());

    // Recovery republishes the outcome for pollers
    let outcome = server.get("/api/outcomes/lost").await.json::<Value>();
    assert_eq!(outcome["status"], "SUCCESS");
    assert_eq!(outcome["reservationId"], record.id.to_string());

    let missing = server
        .post("/api/outcomes/never-issued/recover")
        .json(&json!({"policyId": 1}))
        .await;
    assert_eq!(missing.json::<Value>()["verdict"], "SAFE_TO_RESUBMIT");
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn use_then_cancel_a_reservation() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let record = issued(&env, 10, "a");
    let server = server(&env, StrategyKind::AsyncQueue);

    let used = server
        .post(&format!("/api/reservations/{}/use", record.id))
        .json(&json!({"requesterId": 10, "orderId": 77}))
        .await;
    used.assert_status_ok();
    let body = used.json::<Value>();
    assert_eq!(body["status"], "USED");
    assert_eq!(body["orderId"], 77);

    let again = server
        .post(&format!("/api/reservations/{}/use", record.id))
        .json(&json!({"requesterId": 10, "orderId": 78}))
        .await;
    again.assert_status(StatusCode::CONFLICT);
    assert_eq!(again.json::<Value>()["code"], "ALREADY_USED");

    let cancelled = server
        .post(&format!("/api/reservations/{}/cancel", record.id))
        .json(&json!({"requesterId": 10}))
        .await;
    cancelled.assert_status_ok();
    assert_eq!(cancelled.json::<Value>()["status"], "CANCELLED");
}

#[tokio::test]
async fn strangers_cannot_touch_a_reservation() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let record = issued(&env, 10, "a");
    let server = server(&env, StrategyKind::AsyncQueue);

    server
        .post(&format!("/api/reservations/{}/use", record.id))
        .json(&json!({"requesterId": 11, "orderId": 1}))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    server
        .post(&format!("/api/reservations/{}/cancel", reservation_core::ReservationId::new()))
        .json(&json!({"requesterId": 10}))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn closed_window_blocks_use() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let record = issued(&env, 10, "a");
    env.clock.advance(ChronoDuration::days(2));
    let server = server(&env, StrategyKind::AsyncQueue);

    let response = server
        .post(&format!("/api/reservations/{}/use", record.id))
        .json(&json!({"requesterId": 10, "orderId": 1}))
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.json::<Value>()["code"], "EXPIRED");
}

#[tokio::test]
async fn listing_filters_and_pages() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let first = issued(&env, 10, "a");
    issued(&env, 10, "b");
    issued(&env, 11, "c");
    let server = server(&env, StrategyKind::AsyncQueue);

    let all = server.get("/api/requesters/10/reservations").await;
    all.assert_status_ok();
    assert_eq!(all.json::<Vec<Value>>().len(), 2);

    let one = server
        .get("/api/requesters/10/reservations")
        .add_query_param("size", 1)
        .await
        .json::<Vec<Value>>();
    assert_eq!(one.len(), 1);

    server
        .post(&format!("/api/reservations/{}/use", first.id))
        .json(&json!({"requesterId": 10, "orderId": 5}))
        .await
        .assert_status_ok();

    let used = server
        .get("/api/requesters/10/reservations")
        .add_query_param("status", "used")
        .await
        .json::<Vec<Value>>();
    assert_eq!(used.len(), 1);
    assert_eq!(used[0]["id"], first.id.to_string());

    server
        .get("/api/requesters/10/reservations")
        .add_query_param("status", "lost")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

// ============================================================================
// Activation
// ============================================================================

#[tokio::test]
async fn activation_initializes_the_counter_once() {
    let env = InMemoryBackends::new();
    env.policies.insert(active_policy(3, 20));
    let server = server(&env, StrategyKind::AsyncQueue);

    let first = server.post("/api/policies/3/activate").await;
    first.assert_status_ok();
    let body = first.json::<Value>();
    assert_eq!(body["initialized"], true);
    assert_eq!(body["remaining"], 20);
    assert_eq!(env.counter.value(PolicyId::new(3)), Some(20));

    let second = server.post("/api/policies/3/activate").await.json::<Value>();
    assert_eq!(second["initialized"], false);

    server
        .post("/api/policies/404/activate")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}
