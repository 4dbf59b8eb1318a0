//! RFC-7807 problem responses and request-ID propagation.
//!
//! Every error leaving the API is a `application/problem+json` document with
//! a stable upper-case `code`, and every response (success or failure)
//! carries `X-Request-Id`.

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use recast_common::{Error, RequestId};
use serde::Serialize;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const PROBLEM_TYPE_BASE: &str = "https://recast.dev/problems";

/// Request-scoped trace context, injected by [`request_id_middleware`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: RequestId::new().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_state: Option<crate::truth::ProbeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl Problem {
    pub fn new(status: u16, code: &str, title: &str) -> Self {
        Self {
            type_uri: format!("{PROBLEM_TYPE_BASE}/{}", code.to_ascii_lowercase()),
            title: title.to_string(),
            status,
            code: code.to_ascii_uppercase(),
            detail: None,
            request_id: None,
            retry_after_seconds: None,
            probe_state: None,
            blocked_reason: None,
        }
    }

    /// Problem for a preparing recording, typed under `recordings/`.
    pub fn preparing(retry_after_secs: u32) -> Self {
        let mut problem = Self::new(503, "preparing", "Recording is being prepared");
        problem.type_uri = format!("{PROBLEM_TYPE_BASE}/recordings/preparing");
        problem.retry_after_seconds = Some(retry_after_secs.max(1));
        problem.probe_state = Some(crate::truth::ProbeState::Preparing);
        problem
    }

    pub fn detail<S: Into<String>>(mut self, detail: S) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn request_id(mut self, ctx: &RequestContext) -> Self {
        self.request_id = Some(ctx.request_id.clone());
        self
    }

    pub fn probe_state(mut self, state: crate::truth::ProbeState) -> Self {
        self.probe_state = Some(state);
        self
    }

    pub fn blocked_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.blocked_reason = Some(reason.into());
        self
    }

    /// Map a typed core error into its problem document.
    pub fn from_error(err: &Error, ctx: &RequestContext) -> Self {
        let status = err.http_status();
        let code = err.code();
        let mut problem = Self::new(status, code, title_for(code));
        problem.request_id = Some(ctx.request_id.clone());
        problem.retry_after_seconds = err.retry_after_secs();
        // Internal details never leak; everything else explains itself.
        if status < 500 || matches!(err, Error::Preparing { .. }) {
            problem.detail = Some(err.to_string());
        }
        if let Error::Internal(detail) = err {
            tracing::error!(request_id = %ctx.request_id, detail, "internal error");
        }
        problem
    }
}

fn title_for(code: &str) -> &'static str {
    match code {
        "invalid_input" => "Invalid request",
        "invalid_id" => "Invalid identifier",
        "not_found" => "Not found",
        "forbidden" => "Forbidden",
        "duplicate" => "Duplicate",
        "conflict" => "Conflict",
        "unprocessable" => "Unprocessable request",
        "preparing" => "Recording is being prepared",
        "upstream_unavailable" => "Receiver unavailable",
        "upstream_result_false" => "Receiver reported failure",
        "admission_rejected" => "Capacity exhausted",
        "hwaccel_unavailable" => "Hardware acceleration unavailable",
        "no_tuner_slots" => "No tuner slots",
        "receiver_inconsistent" => "Receiver state inconsistent",
        _ => "Internal error",
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE);
        if let Some(retry) = self.retry_after_seconds {
            response = response.header(header::RETRY_AFTER, retry.to_string());
        }
        if let Some(request_id) = &self.request_id {
            if let Ok(value) = HeaderValue::from_str(request_id) {
                response = response.header(REQUEST_ID_HEADER, value);
            }
        }
        let body = serde_json::to_vec(&self).unwrap_or_default();
        response
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Generate or propagate `X-Request-Id` and stamp it on the response.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_valid_request_id(v))
        .map(str::to_string)
        .unwrap_or_else(|| RequestId::new().to_string());

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
    });

    let mut response = next.run(request).await;
    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }
    response
}

fn is_valid_request_id(v: &str) -> bool {
    !v.is_empty()
        && v.len() <= 128
        && v.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_from_error_shapes() {
        let ctx = RequestContext::default();

        let problem = Problem::from_error(&Error::preparing("building", 3), &ctx);
        assert_eq!(problem.status, 503);
        assert_eq!(problem.code, "PREPARING");
        assert_eq!(problem.retry_after_seconds, Some(3));
        assert_eq!(problem.request_id.as_deref(), Some(ctx.request_id.as_str()));

        let problem = Problem::from_error(&Error::invalid_id("bad"), &ctx);
        assert_eq!(problem.status, 400);
        assert_eq!(problem.code, "INVALID_ID");
        assert!(problem.detail.is_some());
    }

    #[test]
    fn test_internal_detail_never_leaks() {
        let ctx = RequestContext::default();
        let problem = Problem::from_error(&Error::internal("secret db path"), &ctx);
        assert_eq!(problem.status, 500);
        assert!(problem.detail.is_none());
    }

    #[test]
    fn test_preparing_problem_body() {
        let problem = Problem::preparing(0);
        // Retry-After is clamped to at least one second.
        assert_eq!(problem.retry_after_seconds, Some(1));
        assert!(problem.type_uri.ends_with("recordings/preparing"));
        let body = serde_json::to_string(&problem).unwrap();
        assert!(body.contains("PREPARING"));
    }

    #[test]
    fn test_problem_serialization_fields() {
        let ctx = RequestContext {
            request_id: "req-1".into(),
        };
        let problem = Problem::new(409, "conflict", "Conflict")
            .detail("overlap")
            .request_id(&ctx);
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["type"], "https://recast.dev/problems/conflict");
        assert_eq!(json["code"], "CONFLICT");
        assert_eq!(json["status"], 409);
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["detail"], "overlap");
    }

    #[test]
    fn test_request_id_validation() {
        assert!(is_valid_request_id("abc-123_x.y"));
        assert!(!is_valid_request_id(""));
        assert!(!is_valid_request_id("has space"));
        assert!(!is_valid_request_id(&"x".repeat(200)));
    }
}
