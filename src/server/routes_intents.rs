//! Intent routes.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};

use crate::intents::IntentRequest;
use crate::server::problem::{Problem, RequestContext};
use crate::server::AppContext;

/// `POST /intents` — always 202 on success with
/// `{sessionId, status, correlationId}`.
pub async fn post_intent(
    State(ctx): State<AppContext>,
    Extension(trace): Extension<RequestContext>,
    payload: Result<Json<IntentRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            // Unknown fields, malformed JSON, and oversized bodies all land
            // here.
            return Problem::new(400, "invalid_input", "Invalid request")
                .detail(rejection.body_text())
                .request_id(&trace)
                .into_response();
        }
    };

    match ctx.intents.handle(request).await {
        Ok(response) => (StatusCode::ACCEPTED, Json(response)).into_response(),
        Err(e) => Problem::from_error(&e, &trace).into_response(),
    }
}
