//! Media serving routes: playlists, segments, and progressive MP4.
//!
//! Response policy: playlists never advertise byte ranges (a Range header on
//! a playlist is answered with 416 and `Content-Range: bytes */<size>`),
//! segments and MP4s are range-capable with 206/416 semantics. Playlists are
//! never cached.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use serde::Deserialize;
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::server::problem::{Problem, RequestContext};
use crate::server::AppContext;
use crate::vod::resolver::ArtifactError;
use crate::vod::store::{Artifact, ArtifactBody};

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    #[serde(default)]
    pub profile: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeshiftQuery {
    pub recording_id: String,
    #[serde(default)]
    pub profile: Option<String>,
}

/// `GET|HEAD /recordings/{id}/playlist.m3u8`
pub async fn get_playlist(
    State(ctx): State<AppContext>,
    Path(recording_id): Path<String>,
    Query(query): Query<MediaQuery>,
    Extension(trace): Extension<RequestContext>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match ctx
        .resolver
        .resolve_playlist(&recording_id, query.profile.as_deref())
    {
        Ok(artifact) => serve_playlist(artifact, &method, &headers).await,
        Err(err) => artifact_problem(err, &trace),
    }
}

/// `GET|HEAD /timeshift.m3u8?recordingId=...`
pub async fn get_timeshift(
    State(ctx): State<AppContext>,
    Query(query): Query<TimeshiftQuery>,
    Extension(trace): Extension<RequestContext>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match ctx
        .resolver
        .resolve_timeshift(&query.recording_id, query.profile.as_deref())
    {
        Ok(artifact) => serve_playlist(artifact, &method, &headers).await,
        Err(err) => artifact_problem(err, &trace),
    }
}

/// `GET|HEAD /recordings/{id}/{segment}`
pub async fn get_segment(
    State(ctx): State<AppContext>,
    Path((recording_id, segment)): Path<(String, String)>,
    Extension(trace): Extension<RequestContext>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match ctx.resolver.resolve_segment(&recording_id, &segment) {
        Ok(artifact) => serve_rangeable(artifact, &method, &headers).await,
        Err(err) => artifact_problem(err, &trace),
    }
}

/// `GET|HEAD /recordings/{id}/stream.mp4`
pub async fn get_mp4(
    State(ctx): State<AppContext>,
    Path(recording_id): Path<String>,
    Query(query): Query<MediaQuery>,
    Extension(trace): Extension<RequestContext>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match ctx
        .resolver
        .resolve_mp4(&recording_id, query.profile.as_deref())
    {
        Ok(artifact) => serve_rangeable(artifact, &method, &headers).await,
        Err(err) => artifact_problem(err, &trace),
    }
}

fn artifact_problem(err: ArtifactError, trace: &RequestContext) -> Response {
    match err {
        ArtifactError::Preparing { retry_after_secs } => Problem::preparing(retry_after_secs)
            .request_id(trace)
            .into_response(),
        ArtifactError::NotFound => Problem::new(404, "not_found", "Artifact not found")
            .request_id(trace)
            .into_response(),
        ArtifactError::Invalid(detail) => Problem::new(400, "invalid_id", "Invalid identifier")
            .detail(detail)
            .request_id(trace)
            .into_response(),
        ArtifactError::Internal(detail) => {
            tracing::error!(request_id = %trace.request_id, detail, "artifact resolution failed");
            Problem::new(500, "internal_error", "Internal error")
                .request_id(trace)
                .into_response()
        }
    }
}

/// Serve a playlist: no `Accept-Ranges`, `Cache-Control: no-store`, and 416
/// for any Range attempt.
async fn serve_playlist(artifact: Artifact, method: &Method, headers: &HeaderMap) -> Response {
    let size = match artifact_size(&artifact).await {
        Ok(size) => size,
        Err(response) => return response,
    };

    if headers.contains_key(header::RANGE) {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{size}"))
            .header(header::CACHE_CONTROL, "no-store")
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, artifact.mime)
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::CONTENT_LENGTH, size.to_string());

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        match full_body(&artifact).await {
            Ok(body) => body,
            Err(response) => return response,
        }
    };

    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Serve a range-capable artifact (segment or MP4).
async fn serve_rangeable(artifact: Artifact, method: &Method, headers: &HeaderMap) -> Response {
    let size = match artifact_size(&artifact).await {
        Ok(size) => size,
        Err(response) => return response,
    };

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let range = match range_header {
        None => None,
        Some(raw) => match parse_range_header(raw, size) {
            Some(range) => Some(range),
            // Malformed or unsatisfiable: 416 with the star form.
            None => {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                    .header(header::ACCEPT_RANGES, "bytes")
                    .body(Body::empty())
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
        },
    };

    match range {
        Some((start, end)) => {
            let length = end - start + 1;
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                match range_body(&artifact, start, length).await {
                    Ok(body) => body,
                    Err(response) => return response,
                }
            };
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, artifact.mime)
                .header(header::CONTENT_LENGTH, length.to_string())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{size}"),
                )
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        None => {
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                match full_body(&artifact).await {
                    Ok(body) => body,
                    Err(response) => return response,
                }
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, artifact.mime)
                .header(header::CONTENT_LENGTH, size.to_string())
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

async fn artifact_size(artifact: &Artifact) -> Result<u64, Response> {
    match &artifact.body {
        ArtifactBody::Inline(data) => Ok(data.len() as u64),
        ArtifactBody::File(path) => tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .map_err(|_| StatusCode::NOT_FOUND.into_response()),
    }
}

async fn full_body(artifact: &Artifact) -> Result<Body, Response> {
    match &artifact.body {
        ArtifactBody::Inline(data) => Ok(Body::from(data.clone())),
        ArtifactBody::File(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
            Ok(Body::from_stream(ReaderStream::new(file)))
        }
    }
}

async fn range_body(artifact: &Artifact, start: u64, length: u64) -> Result<Body, Response> {
    match &artifact.body {
        ArtifactBody::Inline(data) => {
            let start = start as usize;
            let end = (start + length as usize).min(data.len());
            Ok(Body::from(data.slice(start..end)))
        }
        ArtifactBody::File(path) => {
            let mut file = tokio::fs::File::open(path)
                .await
                .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?;
            Ok(Body::from_stream(ReaderStream::new(file.take(length))))
        }
    }
}

/// Parse an HTTP Range header against a known size.
///
/// Supports `bytes=0-499`, `bytes=500-`, and `bytes=-500`. Multi-range and
/// malformed inputs yield `None` (the caller answers 416).
fn parse_range_header(header: &str, file_size: u64) -> Option<(u64, u64)> {
    let header = header.strip_prefix("bytes=")?;
    if header.contains(',') || file_size == 0 {
        return None;
    }

    let (start, end) = header.split_once('-')?;
    let start = start.trim();
    let end = end.trim();

    match (start.is_empty(), end.is_empty()) {
        // bytes=-500 (last 500 bytes)
        (true, false) => {
            let suffix_len: u64 = end.parse().ok()?;
            if suffix_len == 0 {
                return None;
            }
            let start = file_size.saturating_sub(suffix_len);
            Some((start, file_size - 1))
        }
        // bytes=500- (from 500 to end)
        (false, true) => {
            let start: u64 = start.parse().ok()?;
            if start >= file_size {
                return None;
            }
            Some((start, file_size - 1))
        }
        // bytes=0-499
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if start >= file_size {
                return None;
            }
            let end = end.min(file_size - 1);
            if start > end {
                return None;
            }
            Some((start, end))
        }
        // bytes=- (invalid)
        (true, true) => None,
    }
}
