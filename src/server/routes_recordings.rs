//! Recording browse and stream-info routes.
//!
//! The browser never leaks absolute receiver paths: entries are addressed by
//! opaque recording IDs plus sanitized relative paths. Stream-info combines
//! the probe registry (C4), the truth resolver (C3), and the decision engine
//! (C7) into one `PlaybackInfo` document.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Extension, Json,
};
use recast_common::{sanitize_rel_path, RecordingId, ServiceRef};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::decision::{self, token, Capabilities, Decision, Policy};
use crate::probe::TriggerOutcome;
use crate::server::problem::{Problem, RequestContext};
use crate::server::AppContext;
use crate::truth::{self, MediaTruth, ProbeState, TruthState};

// ---------------------------------------------------------------------------
// Browse
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowseResponse {
    pub roots: Vec<String>,
    pub current_root: String,
    pub current_path: String,
    pub recordings: Vec<RecordingDto>,
    pub directories: Vec<String>,
    pub breadcrumbs: Vec<Breadcrumb>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingDto {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
    pub name: String,
    pub path: String,
}

/// `GET /recordings?root=<id>&path=<rel>`
pub async fn browse(
    State(ctx): State<AppContext>,
    Query(query): Query<BrowseQuery>,
    Extension(trace): Extension<RequestContext>,
) -> Response {
    let (rel_path, blocked) = sanitize_rel_path(query.path.as_deref().unwrap_or(""));
    if blocked {
        return Problem::new(400, "invalid_input", "Invalid request")
            .detail("browse path rejected")
            .request_id(&trace)
            .into_response();
    }

    let client = match ctx.receiver_client() {
        Ok(client) => client,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };

    let path_param = (!rel_path.is_empty()).then_some(rel_path.as_str());
    let listing = match client.recordings(query.root.as_deref(), path_param).await {
        Ok(listing) => listing,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };

    let recordings = listing
        .recordings
        .into_iter()
        .filter_map(|entry| {
            // Unparseable references are dropped rather than leaked raw.
            let sref = ServiceRef::parse(&entry.service_ref).ok()?;
            Some(RecordingDto {
                id: RecordingId::encode(&sref).to_string(),
                name: entry.name,
                duration_secs: entry.duration_secs,
                size_bytes: entry.size_bytes,
            })
        })
        .collect();

    Json(BrowseResponse {
        roots: listing.roots,
        current_root: query.root.unwrap_or_default(),
        current_path: rel_path.clone(),
        recordings,
        directories: listing.directories,
        breadcrumbs: breadcrumbs_for(&rel_path),
    })
    .into_response()
}

fn breadcrumbs_for(rel_path: &str) -> Vec<Breadcrumb> {
    let mut crumbs = Vec::new();
    let mut acc = String::new();
    for segment in rel_path.split('/').filter(|s| !s.is_empty()) {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(segment);
        crumbs.push(Breadcrumb {
            name: segment.to_string(),
            path: acc.clone(),
        });
    }
    crumbs
}

// ---------------------------------------------------------------------------
// Stream info
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfoRequest {
    pub capabilities_version: u32,
    pub capabilities: Capabilities,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackInfo {
    pub media_truth: MediaTruth,
    pub decision: DecisionDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionDto {
    pub mode: &'static str,
    pub selected: decision::Selected,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_output_kind: Option<decision::OutputKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_output_url: Option<String>,
    pub outputs: Vec<decision::Output>,
    pub reasons: Vec<&'static str>,
    pub constraints: Vec<String>,
    pub trace: decision::Trace,
}

/// `GET /recordings/{id}/stream-info` — decision against default browser
/// capabilities.
pub async fn stream_info_get(
    State(ctx): State<AppContext>,
    Path(recording_id): Path<String>,
    Extension(trace): Extension<RequestContext>,
) -> Response {
    stream_info(ctx, recording_id, default_capabilities(), trace).await
}

/// `POST /recordings/{id}/stream-info` — decision against client-reported
/// capabilities.
pub async fn stream_info_post(
    State(ctx): State<AppContext>,
    Path(recording_id): Path<String>,
    Extension(trace): Extension<RequestContext>,
    Json(request): Json<StreamInfoRequest>,
) -> Response {
    if request.capabilities_version < 1 {
        return Problem::new(400, "invalid_capabilities", "Invalid capabilities")
            .detail("capabilitiesVersion must be at least 1")
            .request_id(&trace)
            .into_response();
    }
    stream_info(ctx, recording_id, request.capabilities, trace).await
}

async fn stream_info(
    ctx: AppContext,
    recording_id: String,
    caps: Capabilities,
    trace: RequestContext,
) -> Response {
    let sref = match RecordingId::decode(&recording_id) {
        Ok(sref) => sref,
        Err(e) => return Problem::from_error(&e, &trace).into_response(),
    };
    let probe_key = sref.digest();
    let retry_after = ctx.config.vod.retry_after_secs.max(1);

    let record = ctx.registry.get(&probe_key);
    let truth = match record.state {
        ProbeState::Ready => {
            let info = record.info.unwrap_or_default();
            build_truth(&info)
        }
        ProbeState::Unknown | ProbeState::Failed => {
            let outcome = ctx
                .probe_pool
                .trigger(&probe_key, PathBuf::from(sref.path()));
            let mut problem = Problem::preparing(retry_after).request_id(&trace);
            if record.state == ProbeState::Failed {
                problem = problem.probe_state(ProbeState::Failed);
                if let Some(error) = record.error {
                    problem = problem.blocked_reason(error);
                }
            }
            if outcome == TriggerOutcome::QueueFull {
                problem = problem.blocked_reason("probe queue full");
            }
            return problem.into_response();
        }
        ProbeState::Preparing => {
            return Problem::preparing(retry_after)
                .request_id(&trace)
                .into_response();
        }
    };

    let policy = Policy {
        allow_transcode: ctx.config.policy.allow_transcode,
    };
    let (fingerprint, mut decision) = decision::decide(&truth, &caps, &policy);
    decision.trace = decision::Trace {
        request_id: trace.request_id.clone(),
        session_id: None,
    };

    let decision_token = mint_token(&ctx, &sref, &decision, &fingerprint);
    let dto = map_decision(decision, &recording_id);

    Json(PlaybackInfo {
        media_truth: truth,
        decision: dto,
        decision_token,
    })
    .into_response()
}

/// Conservative default when the client does not describe itself: a web
/// browser that can play MP4/H.264 directly and HLS through hls.js.
fn default_capabilities() -> Capabilities {
    Capabilities {
        containers: vec!["mp4".into()],
        video_codecs: vec!["h264".into()],
        audio_codecs: vec!["aac".into(), "mp3".into()],
        supports_hls: true,
        hls_engines: vec![decision::HlsEngine::Hlsjs],
        supports_range: true,
        allow_transcode: true,
        max_video: None,
        device_type: Some("browser".into()),
    }
}

fn build_truth(info: &crate::probe::StreamInfo) -> MediaTruth {
    let duration = truth::resolve(truth::DurationInput {
        primary_secs: None,
        secondary_secs: info.duration_secs,
        secondary_source: Some(truth::SecondarySource::Ffprobe),
        secondary_failed: false,
        allow_heuristic: false,
        heuristic_secs: None,
        raw_reasons: Vec::new(),
    });
    MediaTruth {
        container: info.container.clone(),
        video_codec: info.video_codec.clone(),
        audio_codec: info.audio_codec.clone(),
        width: info.width,
        height: info.height,
        fps: info.fps,
        duration_ms: duration.duration_ms,
        duration_source: duration.source,
        duration_confidence: duration.confidence,
        duration_reasons: duration.reasons,
        state: TruthState::Ready,
        probe_state: ProbeState::Ready,
        probe_blocked_reason: None,
        retry_after_seconds: None,
    }
}

/// Substitute placeholder URLs with route-bound ones and flatten reasons.
fn map_decision(decision: Decision, recording_id: &str) -> DecisionDto {
    let substitute = |url: &str| -> String {
        url.replace(
            decision::PLACEHOLDER_PLAYLIST,
            &format!("/api/v3/recordings/{recording_id}/playlist.m3u8"),
        )
        .replace(
            decision::PLACEHOLDER_MP4,
            &format!("/api/v3/recordings/{recording_id}/stream.mp4"),
        )
    };

    DecisionDto {
        mode: decision.final_mode().as_str(),
        selected: decision.selected.clone(),
        selected_output_kind: decision.selected_output_kind,
        selected_output_url: decision.selected_output_url.as_deref().map(substitute),
        outputs: decision
            .outputs
            .iter()
            .map(|o| decision::Output {
                kind: o.kind,
                url: substitute(&o.url),
            })
            .collect(),
        reasons: decision.reasons.iter().map(|r| r.as_str()).collect(),
        constraints: decision.constraints.clone(),
        trace: decision.trace.clone(),
    }
}

fn mint_token(
    ctx: &AppContext,
    sref: &ServiceRef,
    decision: &Decision,
    fingerprint: &str,
) -> Option<String> {
    if decision.mode == decision::Mode::Deny {
        return None;
    }
    let claims = token::Claims::new(
        &ctx.config.server.token_issuer,
        &ctx.config.server.token_audience,
        sref.as_str(),
        decision.final_mode().as_str(),
        fingerprint,
        chrono::Utc::now().timestamp(),
        token::MAX_TTL_SECS,
    )
    .ok()?;
    match token::sign(&ctx.token_secret, &claims) {
        Ok(token) => Some(token),
        Err(e) => {
            tracing::warn!(error = %e, "decision token signing failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breadcrumbs() {
        let crumbs = breadcrumbs_for("movie/series/s01");
        assert_eq!(crumbs.len(), 3);
        assert_eq!(crumbs[0].name, "movie");
        assert_eq!(crumbs[0].path, "movie");
        assert_eq!(crumbs[2].path, "movie/series/s01");
        assert!(breadcrumbs_for("").is_empty());
    }

    #[test]
    fn test_default_capabilities_shape() {
        let caps = default_capabilities();
        assert!(caps.supports_hls);
        assert!(caps.supports_range);
        assert_eq!(caps.hls_engines, vec![decision::HlsEngine::Hlsjs]);
    }

    #[test]
    fn test_map_decision_substitutes_urls() {
        let truth = MediaTruth {
            container: "ts".into(),
            video_codec: "h264".into(),
            audio_codec: "mp2".into(),
            state: TruthState::Ready,
            ..Default::default()
        };
        let caps = Capabilities {
            supports_hls: true,
            hls_engines: vec![decision::HlsEngine::Native],
            ..default_capabilities()
        };
        let (_, decision) =
            decision::decide(&truth, &caps, &Policy { allow_transcode: true });
        let dto = map_decision(decision, "RID123");
        assert_eq!(dto.mode, "native_hls");
        let url = dto.selected_output_url.unwrap();
        assert_eq!(url, "/api/v3/recordings/RID123/playlist.m3u8");
        assert!(!url.contains("placeholder"));
    }

    #[test]
    fn test_map_decision_deny_keeps_nulls() {
        let truth = MediaTruth::default();
        let caps = default_capabilities();
        let (_, decision) =
            decision::decide(&truth, &caps, &Policy { allow_transcode: true });
        let dto = map_decision(decision, "RID123");
        assert_eq!(dto.mode, "deny");
        assert!(dto.selected_output_url.is_none());
        assert!(dto.outputs.is_empty());
        assert_eq!(dto.reasons, vec!["probe_incomplete"]);
    }
}
