//! Playback decision engine.
//!
//! `decide` is a pure, fail-closed function mapping (media truth, client
//! capabilities, server policy) to a playback decision with deterministic
//! reason codes. No I/O, no clock: everything a decision depends on is in its
//! inputs, which also makes the fingerprint stable.

pub mod token;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::truth::MediaTruth;

/// Client capability description, normalized by the HTTP layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub containers: Vec<String>,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub supports_hls: bool,
    pub hls_engines: Vec<HlsEngine>,
    pub supports_range: bool,
    pub allow_transcode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_video: Option<MaxVideo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HlsEngine {
    Native,
    Hlsjs,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxVideo {
    pub width: u32,
    pub height: u32,
}

/// Server-side policy inputs.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Policy {
    pub allow_transcode: bool,
}

/// Internal decision mode. The client-facing vocabulary is [`FinalMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    DirectPlay,
    DirectStream,
    Transcode,
    Deny,
}

/// Client-facing playback mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalMode {
    DirectMp4,
    NativeHls,
    Hlsjs,
    Transcode,
    Deny,
}

impl FinalMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectMp4 => "direct_mp4",
            Self::NativeHls => "native_hls",
            Self::Hlsjs => "hlsjs",
            Self::Transcode => "transcode",
            Self::Deny => "deny",
        }
    }
}

/// Closed vocabulary of decision reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    ProbeIncomplete,
    DirectPlayEligible,
    ContainerNotSupported,
    VideoCodecNotSupported,
    AudioCodecNotSupported,
    RangeNotSupported,
    NativeHlsSelected,
    HlsjsSelected,
    HlsEngineUnavailable,
    TranscodeFallback,
    TranscodeDisabledByPolicy,
    TranscodeDisabledByClient,
    NoCompatiblePlaybackPath,
}

impl Reason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProbeIncomplete => "probe_incomplete",
            Self::DirectPlayEligible => "direct_play_eligible",
            Self::ContainerNotSupported => "container_not_supported",
            Self::VideoCodecNotSupported => "video_codec_not_supported",
            Self::AudioCodecNotSupported => "audio_codec_not_supported",
            Self::RangeNotSupported => "range_not_supported",
            Self::NativeHlsSelected => "native_hls_selected",
            Self::HlsjsSelected => "hlsjs_selected",
            Self::HlsEngineUnavailable => "hls_engine_unavailable",
            Self::TranscodeFallback => "transcode_fallback",
            Self::TranscodeDisabledByPolicy => "transcode_disabled_by_policy",
            Self::TranscodeDisabledByClient => "transcode_disabled_by_client",
            Self::NoCompatiblePlaybackPath => "no_compatible_playback_path",
        }
    }
}

/// Output URL placeholders, substituted with route-bound URLs during DTO
/// mapping.
pub const PLACEHOLDER_PLAYLIST: &str = "placeholder:///playlist.m3u8";
pub const PLACEHOLDER_MP4: &str = "placeholder:///stream.mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    File,
    Hls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub kind: OutputKind,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selected {
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub mode: Mode,
    pub selected: Selected,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_output_kind: Option<OutputKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_output_url: Option<String>,
    pub outputs: Vec<Output>,
    pub reasons: Vec<Reason>,
    pub constraints: Vec<String>,
    pub trace: Trace,
    /// Which HLS engine carried a direct-stream decision, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<HlsEngine>,
}

impl Decision {
    /// Map the internal mode to the client-facing vocabulary.
    #[must_use]
    pub fn final_mode(&self) -> FinalMode {
        match self.mode {
            Mode::DirectPlay => FinalMode::DirectMp4,
            Mode::DirectStream => match self.engine {
                Some(HlsEngine::Native) => FinalMode::NativeHls,
                _ => FinalMode::Hlsjs,
            },
            Mode::Transcode => FinalMode::Transcode,
            Mode::Deny => FinalMode::Deny,
        }
    }
}

const DIRECT_PLAY_CONTAINERS: &[&str] = &["mp4", "mov", "m4v"];
const DIRECT_PLAY_VIDEO: &[&str] = &["h264", "avc", "avc1"];
const DIRECT_PLAY_AUDIO: &[&str] = &["aac", "mp3"];

/// Decide how a client should play the given source.
///
/// Returns a stable fingerprint of the inputs alongside the decision, so
/// identical situations can be correlated across requests.
#[must_use]
pub fn decide(truth: &MediaTruth, caps: &Capabilities, policy: &Policy) -> (String, Decision) {
    let fingerprint = fingerprint(truth, caps, policy);

    if !truth.is_decidable() {
        return (fingerprint, deny(vec![Reason::ProbeIncomplete]));
    }

    let mut evidence: Vec<Reason> = Vec::new();

    if let Some(decision) = try_direct_play(truth, caps, &mut evidence) {
        return (fingerprint, decision);
    }

    if let Some(decision) = try_hls(truth, caps, &mut evidence) {
        return (fingerprint, decision);
    }

    if policy.allow_transcode && caps.allow_transcode {
        push(&mut evidence, Reason::TranscodeFallback);
        let decision = Decision {
            mode: Mode::Transcode,
            selected: Selected {
                container: "mp4".into(),
                video_codec: "h264".into(),
                audio_codec: "aac".into(),
            },
            selected_output_kind: Some(OutputKind::Hls),
            selected_output_url: Some(PLACEHOLDER_PLAYLIST.into()),
            outputs: vec![Output {
                kind: OutputKind::Hls,
                url: PLACEHOLDER_PLAYLIST.into(),
            }],
            reasons: evidence,
            constraints: Vec::new(),
            trace: Trace::default(),
            engine: None,
        };
        return (fingerprint, decision);
    }
    if !policy.allow_transcode {
        push(&mut evidence, Reason::TranscodeDisabledByPolicy);
    } else {
        push(&mut evidence, Reason::TranscodeDisabledByClient);
    }

    // Fail closed: the primary reason leads, collected evidence follows.
    let mut reasons = vec![Reason::NoCompatiblePlaybackPath];
    for r in evidence {
        push(&mut reasons, r);
    }
    (fingerprint, deny(reasons))
}

fn try_direct_play(
    truth: &MediaTruth,
    caps: &Capabilities,
    evidence: &mut Vec<Reason>,
) -> Option<Decision> {
    let container = truth.container.to_ascii_lowercase();
    let video = truth.video_codec.to_ascii_lowercase();
    let audio = truth.audio_codec.to_ascii_lowercase();

    let container_ok =
        DIRECT_PLAY_CONTAINERS.contains(&container.as_str()) && supports(&caps.containers, &container);
    let video_ok = DIRECT_PLAY_VIDEO.contains(&video.as_str()) && supports(&caps.video_codecs, &video);
    let audio_ok = DIRECT_PLAY_AUDIO.contains(&audio.as_str()) && supports(&caps.audio_codecs, &audio);

    if !container_ok {
        push(evidence, Reason::ContainerNotSupported);
    }
    if !video_ok {
        push(evidence, Reason::VideoCodecNotSupported);
    }
    if !audio_ok {
        push(evidence, Reason::AudioCodecNotSupported);
    }
    if !caps.supports_range {
        push(evidence, Reason::RangeNotSupported);
    }

    if !(container_ok && video_ok && audio_ok && caps.supports_range) {
        return None;
    }

    Some(Decision {
        mode: Mode::DirectPlay,
        selected: Selected {
            container: container.clone(),
            video_codec: video,
            audio_codec: audio,
        },
        selected_output_kind: Some(OutputKind::File),
        selected_output_url: Some(PLACEHOLDER_MP4.into()),
        outputs: vec![Output {
            kind: OutputKind::File,
            url: PLACEHOLDER_MP4.into(),
        }],
        reasons: vec![Reason::DirectPlayEligible],
        constraints: Vec::new(),
        trace: Trace::default(),
        engine: None,
    })
}

fn try_hls(truth: &MediaTruth, caps: &Capabilities, evidence: &mut Vec<Reason>) -> Option<Decision> {
    if !caps.supports_hls {
        push(evidence, Reason::HlsEngineUnavailable);
        return None;
    }
    let native = caps.hls_engines.contains(&HlsEngine::Native);
    let hlsjs = caps.hls_engines.contains(&HlsEngine::Hlsjs);

    let (engine, reason) = if native && !hlsjs {
        (HlsEngine::Native, Reason::NativeHlsSelected)
    } else if hlsjs {
        (HlsEngine::Hlsjs, Reason::HlsjsSelected)
    } else {
        push(evidence, Reason::HlsEngineUnavailable);
        return None;
    };

    let mut reasons = evidence.clone();
    push(&mut reasons, reason);

    Some(Decision {
        mode: Mode::DirectStream,
        selected: Selected {
            container: truth.container.to_ascii_lowercase(),
            video_codec: truth.video_codec.to_ascii_lowercase(),
            audio_codec: truth.audio_codec.to_ascii_lowercase(),
        },
        selected_output_kind: Some(OutputKind::Hls),
        selected_output_url: Some(PLACEHOLDER_PLAYLIST.into()),
        outputs: vec![Output {
            kind: OutputKind::Hls,
            url: PLACEHOLDER_PLAYLIST.into(),
        }],
        reasons,
        constraints: Vec::new(),
        trace: Trace::default(),
        engine: Some(engine),
    })
}

fn deny(reasons: Vec<Reason>) -> Decision {
    debug_assert!(!reasons.is_empty());
    Decision {
        mode: Mode::Deny,
        selected: Selected::default(),
        selected_output_kind: None,
        selected_output_url: None,
        outputs: Vec::new(),
        reasons,
        constraints: Vec::new(),
        trace: Trace::default(),
        engine: None,
    }
}

fn supports(haystack: &[String], needle: &str) -> bool {
    haystack.iter().any(|c| c.eq_ignore_ascii_case(needle))
}

/// Append preserving first occurrence.
fn push(reasons: &mut Vec<Reason>, reason: Reason) {
    if !reasons.contains(&reason) {
        reasons.push(reason);
    }
}

fn fingerprint(truth: &MediaTruth, caps: &Capabilities, policy: &Policy) -> String {
    let mut hasher = Sha256::new();
    // Canonical JSON of the inputs; field order is fixed by the structs.
    let canonical = serde_json::json!({
        "truth": truth,
        "caps": caps,
        "policy": { "allowTranscode": policy.allow_transcode },
    });
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
