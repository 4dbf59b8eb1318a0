//! Recording browser tests against a mocked receiver.

mod common;

use common::{body_json, TestHarness};
use axum::http::StatusCode;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WIRE_REF: &str = "1:0:19:283D:3FB:1:C00000:0:0:0:/media/hdd/movie/show.ts";

async fn harness_with_listing() -> (TestHarness, MockServer) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/recordings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": true,
            "roots": ["/media/hdd/movie"],
            "directories": ["series"],
            "recordings": [
                {
                    "serviceRef": WIRE_REF,
                    "name": "Show",
                    "durationSecs": 1800.0,
                    "sizeBytes": 1234567
                },
                {
                    "serviceRef": "totally broken ref",
                    "name": "Broken"
                }
            ]
        })))
        .mount(&server)
        .await;

    let mut config = recast::config::Config::default();
    config.receiver.base_url = server.uri();
    (TestHarness::with_config(config), server)
}

#[tokio::test]
async fn browse_returns_opaque_ids_only() {
    let (harness, _server) = harness_with_listing().await;

    let response = harness.get("/api/v3/recordings").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    let recordings = json["recordings"].as_array().unwrap();
    // The unparseable reference was dropped, not leaked.
    assert_eq!(recordings.len(), 1);
    assert_eq!(recordings[0]["name"], "Show");
    assert_eq!(recordings[0]["durationSecs"], 1800.0);

    // The ID decodes back to the wire reference, but no absolute receiver
    // path appears anywhere in the recordings themselves.
    let id = recordings[0]["id"].as_str().unwrap();
    let decoded = recast_common::RecordingId::decode(id).unwrap();
    assert_eq!(decoded.as_str(), WIRE_REF);
    assert!(!serde_json::to_string(&json["recordings"])
        .unwrap()
        .contains("/media/hdd"));
}

#[tokio::test]
async fn browse_builds_breadcrumbs_from_sanitized_path() {
    let (harness, server) = harness_with_listing().await;
    // The mock answers any path; assert the gateway forwarded the clean one.
    let response = harness
        .get("/api/v3/recordings?path=series//s01/./extras")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["currentPath"], "series/s01/extras");
    let crumbs = json["breadcrumbs"].as_array().unwrap();
    assert_eq!(crumbs.len(), 3);
    assert_eq!(crumbs[1]["path"], "series/s01");
    drop(server);
}

#[tokio::test]
async fn browse_blocks_traversal_paths() {
    let (harness, _server) = harness_with_listing().await;
    let response = harness.get("/api/v3/recordings?path=../../etc").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn browse_forwards_root_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/recordings"))
        .and(query_param("root", "movies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": true,
            "roots": [],
            "directories": [],
            "recordings": []
        })))
        .mount(&server)
        .await;

    let mut config = recast::config::Config::default();
    config.receiver.base_url = server.uri();
    let harness = TestHarness::with_config(config);

    let response = harness.get("/api/v3/recordings?root=movies").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["currentRoot"], "movies");
}
