//! Timer routes: CRUD against the receiver plus local conflict preview.
//!
//! Writes go through the receiver client's read-back verification; conflict
//! detection runs locally over the receiver's timer list with the
//! conservative shared-tuner rule.

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Extension, Json,
};
use recast_common::TimerId;
use serde::{Deserialize, Serialize};

use crate::receiver::timers::{detect_conflicts, Conflict, ProposedTimer, Timer};
use crate::server::problem::{Problem, RequestContext};
use crate::server::AppContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTimerRequest {
    pub service_ref: String,
    pub begin: i64,
    pub end: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub padding_before: i64,
    #[serde(default)]
    pub padding_after: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchTimerRequest {
    #[serde(default)]
    pub begin: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPreviewResponse {
    pub conflicts: Vec<Conflict>,
}

/// `GET /timers`
pub async fn list_timers(
    State(ctx): State<AppContext>,
    Extension(trace): Extension<RequestContext>,
) -> Response {
    let client = match ctx.receiver_client() {
        Ok(client) => client,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };
    match client.timers().await {
        Ok(timers) => Json(timers).into_response(),
        Err(e) => Problem::from_error(&e, &trace).into_response(),
    }
}

/// `POST /timers`
pub async fn create_timer(
    State(ctx): State<AppContext>,
    Extension(trace): Extension<RequestContext>,
    Json(request): Json<CreateTimerRequest>,
) -> Response {
    if let Err(problem) = validate_window(request.begin, request.end, &trace) {
        return problem;
    }

    let client = match ctx.receiver_client() {
        Ok(client) => client,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };
    let existing = match client.timers().await {
        Ok(timers) => timers,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };

    let proposed = ProposedTimer {
        service_ref: request.service_ref.clone(),
        begin: request.begin,
        end: request.end,
        padding_before: request.padding_before,
        padding_after: request.padding_after,
    };
    let conflicts = detect_conflicts(&proposed, &existing);
    if conflicts
        .iter()
        .any(|c| matches!(c, Conflict::Duplicate { .. }))
    {
        return Problem::new(409, "duplicate", "Duplicate")
            .detail("an identical timer already exists")
            .request_id(&trace)
            .into_response();
    }
    if !conflicts.is_empty() {
        return Problem::new(409, "conflict", "Conflict")
            .detail(format!("{} overlapping timer(s)", conflicts.len()))
            .request_id(&trace)
            .into_response();
    }

    let timer = Timer {
        id: None,
        service_ref: request.service_ref,
        begin: request.begin,
        end: request.end,
        name: request.name.unwrap_or_default(),
        state: 0,
        disabled: 0,
    };
    match client.add_timer(&timer).await {
        Ok(stored) => (StatusCode::CREATED, Json(stored)).into_response(),
        Err(e) => Problem::from_error(&e, &trace).into_response(),
    }
}

/// `PATCH /timers/{id}`
pub async fn patch_timer(
    State(ctx): State<AppContext>,
    Path(id): Path<u64>,
    Extension(trace): Extension<RequestContext>,
    Json(request): Json<PatchTimerRequest>,
) -> Response {
    let id = TimerId::new(id);
    let client = match ctx.receiver_client() {
        Ok(client) => client,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };

    let existing = match client.timers().await {
        Ok(timers) => timers,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };
    let Some(mut timer) = existing.into_iter().find(|t| t.id == Some(id)) else {
        return Problem::new(404, "not_found", "Not found")
            .detail(format!("timer {id}"))
            .request_id(&trace)
            .into_response();
    };

    if let Some(begin) = request.begin {
        timer.begin = begin;
    }
    if let Some(end) = request.end {
        timer.end = end;
    }
    if let Some(name) = request.name {
        timer.name = name;
    }
    if let Some(disabled) = request.disabled {
        timer.disabled = i32::from(disabled);
    }
    if let Err(problem) = validate_window(timer.begin, timer.end, &trace) {
        return problem;
    }

    match client.change_timer(id, &timer).await {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => Problem::from_error(&e, &trace).into_response(),
    }
}

/// `DELETE /timers/{id}`
pub async fn delete_timer(
    State(ctx): State<AppContext>,
    Path(id): Path<u64>,
    Extension(trace): Extension<RequestContext>,
) -> Response {
    let client = match ctx.receiver_client() {
        Ok(client) => client,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };
    match client.delete_timer(TimerId::new(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => Problem::from_error(&e, &trace).into_response(),
    }
}

/// `POST /timers/conflicts:preview`
///
/// Routed through the catch-all POST below: the custom-method suffix is not
/// expressible as a literal route pattern.
pub async fn post_timer_subresource(
    State(ctx): State<AppContext>,
    Path(segment): Path<String>,
    Extension(trace): Extension<RequestContext>,
    method: Method,
    uri: Uri,
    body: Option<Json<ProposedTimer>>,
) -> Response {
    if method == Method::POST && segment == "conflicts:preview" {
        let Some(Json(proposed)) = body else {
            return Problem::new(400, "invalid_input", "Invalid request")
                .detail("a proposed timer body is required")
                .request_id(&trace)
                .into_response();
        };
        return conflicts_preview(ctx, proposed, trace).await;
    }
    Problem::new(404, "not_found", "Not found")
        .detail(format!("no such resource: {}", uri.path()))
        .request_id(&trace)
        .into_response()
}

async fn conflicts_preview(
    ctx: AppContext,
    proposed: ProposedTimer,
    trace: RequestContext,
) -> Response {
    if let Err(problem) = validate_window(proposed.begin, proposed.end, &trace) {
        return problem;
    }
    let client = match ctx.receiver_client() {
        Ok(client) => client,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };
    match client.timers().await {
        Ok(existing) => Json(ConflictPreviewResponse {
            conflicts: detect_conflicts(&proposed, &existing),
        })
        .into_response(),
        Err(e) => Problem::from_error(&e, &trace).into_response(),
    }
}

fn validate_window(begin: i64, end: i64, trace: &RequestContext) -> Result<(), Response> {
    if begin >= end {
        return Err(Problem::new(422, "invalid_time", "Unprocessable request")
            .detail("begin must be strictly before end")
            .request_id(trace)
            .into_response());
    }
    Ok(())
}
