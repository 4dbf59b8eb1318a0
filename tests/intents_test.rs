//! Intent endpoint contract tests.

mod common;

use common::{body_json, TestHarness};
use axum::http::StatusCode;

fn start_intent(service_ref: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "stream.start",
        "serviceRef": service_ref,
        "params": { "profile": "universal" }
    })
}

#[tokio::test]
async fn start_intent_is_accepted_with_202() {
    let harness = TestHarness::new();
    let (sref, _) = harness.recording("live.ts");

    let response = harness
        .post_json("/api/v3/intents", start_intent(sref.as_str()))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["status"], "accepted");
    assert!(json["sessionId"].is_string());
    assert!(json["correlationId"].is_string());
    assert_eq!(harness.bus.count(), 1);
}

#[tokio::test]
async fn identical_intent_replays_idempotently() {
    let harness = TestHarness::new();
    let (sref, _) = harness.recording("live.ts");
    let body = start_intent(sref.as_str());

    let first = body_json(
        harness.post_json("/api/v3/intents", body.clone()).await,
    )
    .await;
    let second_response = harness.post_json("/api/v3/intents", body).await;
    assert_eq!(second_response.status(), StatusCode::ACCEPTED);
    let second = body_json(second_response).await;

    assert_eq!(second["status"], "idempotent_replay");
    assert_eq!(second["sessionId"], first["sessionId"]);
    assert_eq!(second["correlationId"], first["correlationId"]);
    // The publish counter incremented exactly once.
    assert_eq!(harness.bus.count(), 1);
}

#[tokio::test]
async fn different_bucket_is_a_new_session() {
    let harness = TestHarness::new();
    let (sref, _) = harness.recording("live.ts");

    let live = start_intent(sref.as_str());
    let mut seek = start_intent(sref.as_str());
    seek["startMs"] = serde_json::json!(90_000);

    let first = body_json(harness.post_json("/api/v3/intents", live).await).await;
    let second = body_json(harness.post_json("/api/v3/intents", seek).await).await;
    assert_ne!(first["sessionId"], second["sessionId"]);
    assert_eq!(harness.bus.count(), 2);
}

#[tokio::test]
async fn stop_round_trip() {
    let harness = TestHarness::new();
    let (sref, _) = harness.recording("live.ts");

    let started = body_json(
        harness
            .post_json("/api/v3/intents", start_intent(sref.as_str()))
            .await,
    )
    .await;

    let stop = serde_json::json!({
        "type": "stream.stop",
        "sessionId": started["sessionId"],
    });
    let response = harness.post_json("/api/v3/intents", stop).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["status"], "accepted");
    assert_eq!(json["correlationId"], started["correlationId"]);
}

#[tokio::test]
async fn stop_unknown_session_is_404() {
    let harness = TestHarness::new();
    let stop = serde_json::json!({
        "type": "stream.stop",
        "sessionId": uuid::Uuid::new_v4().to_string(),
    });
    let response = harness.post_json("/api/v3/intents", stop).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_fields_are_rejected() {
    let harness = TestHarness::new();
    let (sref, _) = harness.recording("live.ts");
    let mut body = start_intent(sref.as_str());
    body["surprise"] = serde_json::json!(true);

    let response = harness.post_json("/api/v3/intents", body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn private_url_source_is_forbidden() {
    let harness = TestHarness::new();
    let body = serde_json::json!({
        "type": "stream.start",
        "serviceRef": "http://127.0.0.1:9999/stream",
    });
    let response = harness.post_json("/api/v3/intents", body).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn hwaccel_force_without_gpu_is_400() {
    let harness = TestHarness::new();
    let (sref, _) = harness.recording("live.ts");
    let body = serde_json::json!({
        "type": "stream.start",
        "serviceRef": sref.as_str(),
        "params": { "hwaccel": "force" }
    });
    let response = harness.post_json("/api/v3/intents", body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "HWACCEL_UNAVAILABLE");
}

#[tokio::test]
async fn admission_rejects_when_no_tuners() {
    let mut config = recast::config::Config::default();
    config.admission.tuner_slots = 0;
    let harness = TestHarness::with_config(config);
    let (sref, _) = harness.recording("live.ts");

    let response = harness
        .post_json("/api/v3/intents", start_intent(sref.as_str()))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("retry-after"));
    let json = body_json(response).await;
    assert_eq!(json["code"], "ADMISSION_REJECTED");
    // Nothing was published or stored.
    assert_eq!(harness.bus.count(), 0);
    assert!(harness.ctx.store.is_empty());
}

#[tokio::test]
async fn correlation_id_is_preserved_when_valid() {
    let harness = TestHarness::new();
    let (sref, _) = harness.recording("live.ts");
    let mut body = start_intent(sref.as_str());
    body["correlationId"] = serde_json::json!("user-action-42");

    let json = body_json(harness.post_json("/api/v3/intents", body).await).await;
    assert_eq!(json["correlationId"], "user-action-42");
}
