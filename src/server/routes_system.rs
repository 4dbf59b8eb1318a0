//! System routes: health, info, scan, refresh, and session administration.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use recast_common::SessionId;
use serde::Serialize;
use std::sync::atomic::Ordering;

use crate::server::problem::{Problem, RequestContext};
use crate::server::AppContext;
use crate::session::bus::{SessionEvent, STOP_REASON_ADMIN};
use crate::storage::StorageSample;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub storage: Vec<StorageSample>,
}

/// `GET /system/health`
pub async fn health(State(ctx): State<AppContext>) -> Response {
    let storage = ctx.storage.latest();
    let degraded = storage
        .iter()
        .any(|s| s.health != crate::storage::HealthStatus::Ok);
    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        active_sessions: ctx.store.len(),
        storage,
    })
    .into_response()
}

/// `GET /system/healthz` — liveness only.
pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub version: &'static str,
    pub config_epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<crate::receiver::ReceiverInfo>,
}

/// `GET /system/info`
pub async fn info(State(ctx): State<AppContext>) -> Response {
    // Receiver info is best-effort; the gateway reports itself regardless.
    let receiver = match ctx.receiver_client() {
        Ok(client) => client.info().await.ok(),
        Err(_) => None,
    };
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        config_epoch: ctx.epoch.load(Ordering::SeqCst),
        receiver,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub roots: Vec<String>,
    pub recordings_seen: usize,
}

/// `GET /system/scan` — walk the receiver's recording roots.
pub async fn scan(
    State(ctx): State<AppContext>,
    Extension(trace): Extension<RequestContext>,
) -> Response {
    let client = match ctx.receiver_client() {
        Ok(client) => client,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };
    match client.recordings(None, None).await {
        Ok(listing) => Json(ScanResponse {
            recordings_seen: listing.recordings.len(),
            roots: listing.roots,
        })
        .into_response(),
        Err(e) => Problem::from_error(&e, &trace).into_response(),
    }
}

/// `POST /system/refresh` — bump the config epoch; the cached receiver
/// client is invalidated and rebuilt on next use.
pub async fn refresh(State(ctx): State<AppContext>) -> impl IntoResponse {
    let epoch = ctx.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(epoch, "configuration epoch bumped");
    StatusCode::ACCEPTED
}

/// `GET /system/sessions` — active session listing.
pub async fn list_sessions(State(ctx): State<AppContext>) -> Response {
    Json(ctx.store.list()).into_response()
}

/// `DELETE /sessions/{id}` — administrative stop.
pub async fn delete_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Extension(trace): Extension<RequestContext>,
) -> Response {
    let session_id = match SessionId::parse(&id) {
        Ok(session_id) => session_id,
        Err(_) => {
            return Problem::new(400, "invalid_id", "Invalid identifier")
                .detail(format!("malformed session ID: {id}"))
                .request_id(&trace)
                .into_response();
        }
    };
    let Some(session) = ctx.store.get(&session_id) else {
        return Problem::new(404, "not_found", "Not found")
            .detail(format!("session {session_id}"))
            .request_id(&trace)
            .into_response();
    };

    if let Err(e) = ctx.bus.publish(SessionEvent::stop(
        session_id,
        STOP_REASON_ADMIN,
        session.correlation_id.as_str(),
    )) {
        return Problem::from_error(&e, &trace).into_response();
    }
    ctx.store.remove(&session_id);
    StatusCode::NO_CONTENT.into_response()
}
