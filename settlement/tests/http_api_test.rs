//! HTTP API tests.
//!
//! Drives the real router with `tower::ServiceExt::oneshot` over the
//! in-memory ledger, so routing, extraction, status mapping and the JSON
//! contract are all exercised without a socket.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use common::Harness;
use raffle_core::types::{IntentId, UserId};
use raffle_settlement::api::USER_ID_HEADER;
use raffle_settlement::api::webhooks::SIGNATURE_HEADER;
use raffle_settlement::server::{AppState, build_router};
use raffle_testing::fixtures;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn router(h: &Harness) -> Router {
    build_router(AppState::new(Arc::clone(&h.engine)))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn json_request(method: &str, uri: &str, user: Option<UserId>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user.to_string());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn health_and_readiness() {
    let h = Harness::new();

    let (status, body) = send(
        router(&h),
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(
        router(&h),
        Request::get("/ready").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn purchase_endpoint_requires_a_user() {
    let h = Harness::new();
    let competition = h.store.seed_competition(fixtures::competition()).await;
    let uri = format!("/api/competitions/{}/purchase", competition.id);

    let (status, body) = send(
        router(&h),
        json_request("POST", &uri, None, &json!({ "quantity": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, body) = send(
        router(&h),
        json_request("POST", &uri, Some(UserId::new()), &json!({ "quantity": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["tickets"].as_array().unwrap().len(), 2);
    assert_eq!(body["total"], 1000);
}

#[tokio::test]
async fn business_errors_map_to_status_codes() {
    let h = Harness::new();
    let competition = h.store.seed_competition(fixtures::competition()).await;
    let user = UserId::new();

    let (status, body) = send(
        router(&h),
        json_request(
            "POST",
            &format!("/api/competitions/{}/purchase", competition.id),
            Some(user),
            &json!({ "quantity": 11 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["message"],
        "You can purchase up to 10 more tickets for this competition."
    );

    let (status, _) = send(
        router(&h),
        json_request(
            "POST",
            &format!("/api/competitions/{}/purchase", UserId::new()),
            Some(user),
            &json!({ "quantity": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn intent_webhook_and_status_round_trip() {
    let h = Harness::new();
    let competition = h.store.seed_competition(fixtures::competition()).await;
    let user = UserId::new();

    let (status, receipt) = send(
        router(&h),
        json_request(
            "POST",
            "/api/payments/intents/single",
            Some(user),
            &json!({ "competition_id": competition.id, "quantity": 3 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["amount"], 1500);
    let intent = IntentId::new(receipt["intent_id"].as_str().unwrap());

    let (body, signature) = h.signed_event("succeeded", &intent, json!({}));
    let webhook = Request::post("/api/webhooks/gateway")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap();
    let (status, outcome) = send(router(&h), webhook).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "settled");

    let status_uri = format!("/api/payments/{intent}");
    let (status, view) = send(
        router(&h),
        Request::get(&status_uri)
            .header(USER_ID_HEADER, user.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "succeeded");
    assert_eq!(view["ticket_numbers"].as_array().unwrap().len(), 3);

    let (status, _) = send(
        router(&h),
        Request::get(&status_uri)
            .header(USER_ID_HEADER, UserId::new().to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unsigned_webhook_is_unauthorized() {
    let h = Harness::new();
    let (body, _) = h.signed_event("succeeded", &IntentId::new("pi_123"), json!({}));

    let (status, error) = send(
        router(&h),
        Request::post("/api/webhooks/gateway")
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(error["message"].as_str().unwrap().contains("signature"));
}

#[tokio::test]
async fn retry_on_succeeded_payment_conflicts() {
    let h = Harness::new();
    let competition = h.store.seed_competition(fixtures::competition()).await;
    let payment = fixtures::pending_single_payment("pi_http", UserId::new(), &competition, 1);
    let payment_id = payment.id;
    h.store.seed_payment(payment).await;
    h.deliver("succeeded", &IntentId::new("pi_http")).await.unwrap();

    let (status, body) = send(
        router(&h),
        Request::post(format!("/api/payments/{payment_id}/retry"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE");

    let (status, refund) = send(
        router(&h),
        json_request(
            "POST",
            &format!("/api/payments/{payment_id}/refund"),
            None,
            &json!({ "reason": "Duplicate order" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refund["amount"], 500);
    assert_eq!(refund["tickets_refunded"], 1);
}

#[tokio::test]
async fn cart_lines_can_be_set_and_removed() {
    let h = Harness::new();
    let competition = h.store.seed_competition(fixtures::competition()).await;
    let user = UserId::new();
    let uri = format!("/api/cart/{}", competition.id);

    let (status, _) = send(
        router(&h),
        json_request("PUT", &uri, Some(user), &json!({ "quantity": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(h.store.snapshot().await.carts.len(), 1);

    let (status, _) = send(
        router(&h),
        json_request("PUT", &uri, Some(user), &json!({ "quantity": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(h.store.snapshot().await.carts.is_empty());
}
