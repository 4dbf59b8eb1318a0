//! Media truth: the authoritative view of a recording's container, codecs,
//! and duration, assembled from receiver metadata, probes, and heuristics.
//!
//! Duration resolution follows a strict ladder: receiver metadata beats the
//! probe/container value, which beats a heuristic, which beats nothing. Each
//! rung lowers confidence. Reasons are append-only evidence; new inputs can
//! only add reasons, never remove them.

use serde::{Deserialize, Serialize};

/// Where the authoritative duration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationSource {
    Metadata,
    Ffprobe,
    Container,
    Heuristic,
    Unknown,
}

/// Confidence attached to the resolved duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationConfidence {
    High,
    Medium,
    Low,
}

/// Probe lifecycle of a recording as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeState {
    Unknown,
    Preparing,
    Ready,
    Failed,
}

/// The resolved view served by stream-info and consumed by the decision
/// engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTruth {
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub duration_source: DurationSource,
    pub duration_confidence: DurationConfidence,
    pub duration_reasons: Vec<String>,
    pub state: TruthState,
    pub probe_state: ProbeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruthState {
    Ready,
    #[default]
    Preparing,
}

impl Default for DurationSource {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Default for DurationConfidence {
    fn default() -> Self {
        Self::Low
    }
}

impl Default for ProbeState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl MediaTruth {
    /// A truth is complete enough to decide on when at least the container
    /// or the video codec is known.
    #[must_use]
    pub fn is_decidable(&self) -> bool {
        self.state == TruthState::Ready
            && (!self.container.is_empty() || !self.video_codec.is_empty())
    }
}

/// Inputs for duration resolution.
#[derive(Debug, Clone, Default)]
pub struct DurationInput {
    /// Receiver metadata duration, when present.
    pub primary_secs: Option<f64>,
    /// Probe- or container-derived duration.
    pub secondary_secs: Option<f64>,
    /// Which rung the secondary value came from.
    pub secondary_source: Option<SecondarySource>,
    /// Whether the probe ran and failed.
    pub secondary_failed: bool,
    /// Heuristic duration (e.g. EPG event length), gated by the caller.
    pub allow_heuristic: bool,
    pub heuristic_secs: Option<f64>,
    /// Evidence collected upstream; carried into the result.
    pub raw_reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondarySource {
    Ffprobe,
    Container,
}

/// The resolved duration with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationTruth {
    pub source: DurationSource,
    pub duration_ms: Option<u64>,
    pub confidence: DurationConfidence,
    pub reasons: Vec<String>,
}

pub const REASON_PRIMARY_MISSING: &str = "duration_primary_missing";
pub const REASON_PROBE_FAILED: &str = "duration_probe_failed";
pub const REASON_RESUME_CLAMPED: &str = "resume_clamped_to_duration";

/// Resolve the authoritative duration from the available evidence.
#[must_use]
pub fn resolve(input: DurationInput) -> DurationTruth {
    let mut reasons = dedup_reasons(input.raw_reasons);

    let positive = |v: Option<f64>| v.filter(|s| *s > 0.0);

    if let Some(primary) = positive(input.primary_secs) {
        return DurationTruth {
            source: DurationSource::Metadata,
            duration_ms: Some(secs_to_ms(primary)),
            confidence: DurationConfidence::High,
            reasons,
        };
    }

    if let Some(secondary) = positive(input.secondary_secs) {
        let source = match input.secondary_source {
            Some(SecondarySource::Container) => DurationSource::Container,
            _ => DurationSource::Ffprobe,
        };
        return DurationTruth {
            source,
            duration_ms: Some(secs_to_ms(secondary)),
            confidence: DurationConfidence::Medium,
            reasons,
        };
    }

    if input.allow_heuristic {
        if let Some(heuristic) = positive(input.heuristic_secs) {
            return DurationTruth {
                source: DurationSource::Heuristic,
                duration_ms: Some(secs_to_ms(heuristic)),
                confidence: DurationConfidence::Low,
                reasons,
            };
        }
    }

    push_reason(&mut reasons, REASON_PRIMARY_MISSING);
    if input.secondary_failed {
        push_reason(&mut reasons, REASON_PROBE_FAILED);
    }
    DurationTruth {
        source: DurationSource::Unknown,
        duration_ms: None,
        confidence: DurationConfidence::Low,
        reasons,
    }
}

/// Clamp a resume position into `[0, duration]`, annotating when clamped.
#[must_use]
pub fn clamp_resume(pos_secs: f64, duration_secs: f64, reasons: &mut Vec<String>) -> f64 {
    let clamped = pos_secs.clamp(0.0, duration_secs.max(0.0));
    if (clamped - pos_secs).abs() > f64::EPSILON {
        push_reason(reasons, REASON_RESUME_CLAMPED);
    }
    clamped
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs * 1000.0).round() as u64
}

/// Append a reason unless already present, preserving first occurrence.
pub fn push_reason(reasons: &mut Vec<String>, reason: &str) {
    if !reasons.iter().any(|r| r == reason) {
        reasons.push(reason.to_string());
    }
}

fn dedup_reasons(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for r in raw {
        if !out.contains(&r) {
            out.push(r);
        }
    }
    out
}
