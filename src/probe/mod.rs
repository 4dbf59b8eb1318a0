//! Media probing.
//!
//! Wraps ffprobe behind a [`Prober`] trait so the pool and the VOD manager
//! can be exercised with instrumented probers in tests.

pub mod pool;

pub use pool::{ProbePool, ProbeRegistry, TriggerOutcome};

use async_trait::async_trait;
use recast_common::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a probe learned about a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamInfo {
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub duration_secs: Option<f64>,
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<StreamInfo>;
}

/// ffprobe-backed prober.
pub struct FfprobeProber {
    binary: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    /// Locate ffprobe on PATH.
    pub fn new(timeout: Duration) -> Result<Self> {
        let binary = which::which("ffprobe")
            .map_err(|e| Error::internal(format!("ffprobe not found: {e}")))?;
        Ok(Self { binary, timeout })
    }

    pub fn with_binary(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<StreamInfo> {
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.binary)
                .arg("-v")
                .arg("error")
                .arg("-print_format")
                .arg("json")
                .arg("-show_format")
                .arg("-show_streams")
                .arg(path)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::internal("ffprobe timed out"))?
        .map_err(|e| Error::internal(format!("ffprobe failed to start: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::internal(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::internal(format!("ffprobe output unparseable: {e}")))?;
        Ok(parsed.into_stream_info())
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    format_name: String,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
}

impl FfprobeOutput {
    fn into_stream_info(self) -> StreamInfo {
        let mut info = StreamInfo::default();
        if let Some(format) = self.format {
            info.container = normalize_container(&format.format_name);
            info.duration_secs = format.duration.and_then(|d| d.parse::<f64>().ok());
        }
        for stream in self.streams {
            match stream.codec_type.as_str() {
                "video" if info.video_codec.is_empty() => {
                    info.video_codec = stream.codec_name;
                    info.width = stream.width;
                    info.height = stream.height;
                    info.fps = stream.avg_frame_rate.as_deref().and_then(parse_frame_rate);
                }
                "audio" if info.audio_codec.is_empty() => {
                    info.audio_codec = stream.codec_name;
                }
                _ => {}
            }
        }
        info
    }
}

/// Map ffprobe's comma-listed demuxer names to a single container label.
fn normalize_container(format_name: &str) -> String {
    let first = format_name.split(',').next().unwrap_or("");
    match first {
        "mpegts" => "ts".to_string(),
        "mov" => "mp4".to_string(),
        "matroska" => "mkv".to_string(),
        other => other.to_string(),
    }
}

/// Parse an `avg_frame_rate` fraction like `25/1`.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}
