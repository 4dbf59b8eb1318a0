//! Build runner: drives an external ffmpeg process for one artifact build.
//!
//! The runner owns process lifecycle only. Policy (singleflight, stall
//! handling, finalization, eviction) lives in the manager, which consumes the
//! handle returned by [`Runner::start`]. Progress is published latest-wins
//! through a watch channel; nobody is obliged to drain it.

use recast_common::{Error, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

use crate::config::ProfileSpec;

/// Source of a build.
#[derive(Debug, Clone)]
pub enum SourceKind {
    File(PathBuf),
    Url(String),
}

impl SourceKind {
    fn as_input(&self) -> String {
        match self {
            Self::File(p) => p.to_string_lossy().into_owned(),
            Self::Url(u) => u.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFlavor {
    Hls,
    Mp4,
}

#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub key: String,
    pub source: SourceKind,
    pub work_dir: PathBuf,
    pub output_name: String,
    pub profile: ProfileSpec,
    pub flavor: OutputFlavor,
}

/// A progress sample parsed from the encoder's progress stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    pub out_time_us: i64,
    pub total_size: u64,
    pub speed: f64,
    pub fps: f64,
}

impl Progress {
    /// Whether this sample shows advancement over `prev`.
    #[must_use]
    pub fn advanced_over(&self, prev: &Progress) -> bool {
        self.out_time_us > prev.out_time_us || self.total_size > prev.total_size
    }
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub stderr_tail: String,
    pub segments_written: usize,
}

/// Why a build failed, and whether retrying can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Input could not be parsed; a later retry may succeed.
    ProbeFailed,
    /// Upstream said no: auth, missing, refused, unroutable.
    SourceUnavailable,
    /// Encoder died for any other reason.
    FfmpegFatal,
    /// Progress stopped advancing and the build was stopped.
    Stalled,
    /// Shut down by the manager.
    Cancelled,
}

impl FailureClass {
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::ProbeFailed | Self::Stalled | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub class: FailureClass,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct BuildSuccess {
    /// Final artifact path for progressive outputs; None for HLS, whose
    /// output is the cache directory itself.
    pub artifact_path: Option<PathBuf>,
}

pub type BuildOutcome = std::result::Result<BuildSuccess, BuildFailure>;

#[derive(Debug, Clone, Copy)]
pub struct StopRequest {
    pub grace: Duration,
}

/// Handle to a running build.
pub struct RunnerHandle {
    outcome: oneshot::Receiver<BuildOutcome>,
    progress: watch::Receiver<Option<Progress>>,
    stop_tx: mpsc::Sender<StopRequest>,
    diagnostics: Arc<Mutex<Diagnostics>>,
}

impl RunnerHandle {
    /// Assemble a handle from its channels. Custom [`Runner`] implementations
    /// (and test fakes) use this to wire their own process model.
    pub fn from_parts(
        outcome: oneshot::Receiver<BuildOutcome>,
        progress: watch::Receiver<Option<Progress>>,
        stop_tx: mpsc::Sender<StopRequest>,
        diagnostics: Arc<Mutex<Diagnostics>>,
    ) -> Self {
        Self {
            outcome,
            progress,
            stop_tx,
            diagnostics,
        }
    }

    /// Wait for the build to finish.
    pub async fn wait(&mut self) -> BuildOutcome {
        match (&mut self.outcome).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BuildFailure {
                class: FailureClass::FfmpegFatal,
                detail: "runner dropped without reporting an outcome".to_string(),
            }),
        }
    }

    /// Request a stop: grace signal first, hard kill after.
    pub async fn stop(&self, grace: Duration) {
        let _ = self.stop_tx.send(StopRequest { grace }).await;
    }

    /// Detached stop handle, usable while `wait` is pending.
    #[must_use]
    pub fn stopper(&self) -> Stopper {
        Stopper {
            tx: self.stop_tx.clone(),
        }
    }

    /// Latest-wins progress stream.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<Option<Progress>> {
        self.progress.clone()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.lock().await.clone()
    }
}

/// Cloneable stop side of a [`RunnerHandle`].
#[derive(Clone)]
pub struct Stopper {
    tx: mpsc::Sender<StopRequest>,
}

impl Stopper {
    pub async fn stop(&self, grace: Duration) {
        let _ = self.tx.send(StopRequest { grace }).await;
    }
}

pub trait Runner: Send + Sync {
    fn start(&self, spec: BuildSpec) -> Result<RunnerHandle>;
}

/// Classify an encoder exit from its stderr tail and segment count.
#[must_use]
pub fn classify_exit(stderr_tail: &str, segments_written: usize) -> FailureClass {
    let lower = stderr_tail.to_ascii_lowercase();
    const UNAVAILABLE: &[&str] = &[
        "401 unauthorized",
        "403 forbidden",
        "404 not found",
        "connection refused",
        "no route to host",
    ];
    if UNAVAILABLE.iter().any(|m| lower.contains(m)) {
        return FailureClass::SourceUnavailable;
    }
    const PROBE: &[&str] = &[
        "could not find codec parameters",
        "invalid data found when processing input",
        "moov atom not found",
        "end of file",
    ];
    if segments_written == 0 && PROBE.iter().any(|m| lower.contains(m)) {
        return FailureClass::ProbeFailed;
    }
    FailureClass::FfmpegFatal
}

/// Count allow-listed segments present in a work directory.
pub fn count_segments(work_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(super::store::segment_name_allowed)
                .unwrap_or(false)
        })
        .count()
}

/// ffmpeg-backed runner.
pub struct FfmpegRunner {
    binary: PathBuf,
}

impl FfmpegRunner {
    pub fn new() -> Result<Self> {
        let binary = which::which("ffmpeg")
            .map_err(|e| Error::internal(format!("ffmpeg not found: {e}")))?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }
}

/// Assemble the encoder invocation for a build.
#[must_use]
pub fn build_args(spec: &BuildSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-y".into(),
        "-loglevel".into(),
        "error".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-i".into(),
        spec.source.as_input(),
    ];

    let encoder = match (spec.profile.video_codec.as_str(), spec.profile.hw_accel.as_deref()) {
        ("hevc" | "h265", Some("nvenc")) => "hevc_nvenc",
        ("hevc" | "h265", Some("qsv")) => "hevc_qsv",
        ("hevc" | "h265", _) => "libx265",
        (_, Some("nvenc")) => "h264_nvenc",
        (_, Some("qsv")) => "h264_qsv",
        (_, Some("videotoolbox")) => "h264_videotoolbox",
        _ => "libx264",
    };
    args.extend(["-c:v".into(), encoder.into()]);

    // Scale down only, preserving aspect ratio.
    args.extend([
        "-vf".into(),
        format!(
            "scale='min({},iw)':'min({},ih)':force_original_aspect_ratio=decrease",
            spec.profile.max_width, spec.profile.max_height
        ),
    ]);

    args.extend([
        "-c:a".into(),
        spec.profile.audio_codec.clone(),
        "-ac".into(),
        "2".into(),
    ]);

    match spec.flavor {
        OutputFlavor::Hls => {
            let segment_template = spec.work_dir.join("seg_%05d.ts");
            let playlist = spec.work_dir.join(super::store::LIVE_PLAYLIST);
            args.extend([
                "-f".into(),
                "hls".into(),
                "-hls_time".into(),
                spec.profile.hls_segment_secs.to_string(),
                "-hls_list_size".into(),
                "0".into(),
                "-hls_segment_filename".into(),
                segment_template.to_string_lossy().into_owned(),
                playlist.to_string_lossy().into_owned(),
            ]);
        }
        OutputFlavor::Mp4 => {
            let tmp = temp_output_path(&spec.work_dir, &spec.output_name);
            args.extend([
                "-movflags".into(),
                "+faststart".into(),
                "-f".into(),
                "mp4".into(),
                tmp.to_string_lossy().into_owned(),
            ]);
        }
    }

    args
}

/// Temporary output name used until the atomic publish rename.
pub fn temp_output_path(work_dir: &Path, output_name: &str) -> PathBuf {
    work_dir.join(format!(".tmp-{output_name}"))
}

impl Runner for FfmpegRunner {
    fn start(&self, spec: BuildSpec) -> Result<RunnerHandle> {
        std::fs::create_dir_all(&spec.work_dir)?;

        let args = build_args(&spec);
        debug!(key = %spec.key, ?args, "starting build");

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::internal(format!("failed to spawn ffmpeg: {e}")))?;

        let (progress_tx, progress_rx) = watch::channel(None);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (stop_tx, mut stop_rx) = mpsc::channel::<StopRequest>(1);
        let diagnostics = Arc::new(Mutex::new(Diagnostics::default()));

        // Progress parser over the encoder's key=value stream.
        let stdout = child.stdout.take();
        tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            let mut sample = Progress::default();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some((k, v)) = line.split_once('=') {
                    match k {
                        "out_time_us" => sample.out_time_us = v.parse().unwrap_or(sample.out_time_us),
                        "total_size" => sample.total_size = v.parse().unwrap_or(sample.total_size),
                        "speed" => {
                            sample.speed =
                                v.trim_end_matches('x').parse().unwrap_or(sample.speed)
                        }
                        "fps" => sample.fps = v.parse().unwrap_or(sample.fps),
                        "progress" => {
                            let _ = progress_tx.send(Some(sample));
                        }
                        _ => {}
                    }
                }
            }
        });

        // Stderr tail collector.
        let stderr = child.stderr.take();
        let diag_for_stderr = Arc::clone(&diagnostics);
        tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            const TAIL_LINES: usize = 64;
            let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
                let mut diag = diag_for_stderr.lock().await;
                diag.stderr_tail = tail.iter().cloned().collect::<Vec<_>>().join("\n");
            }
        });

        // Driver: waits for exit, services stop requests, classifies.
        let diag_for_driver = Arc::clone(&diagnostics);
        tokio::spawn(async move {
            let mut stop_class: Option<FailureClass> = None;

            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(req) = stop_rx.recv() => {
                        stop_class.get_or_insert(FailureClass::Cancelled);
                        graceful_stop(&mut child, req.grace).await;
                    }
                }
            };

            let segments_written = count_segments(&spec.work_dir);
            {
                let mut diag = diag_for_driver.lock().await;
                diag.segments_written = segments_written;
            }

            let outcome = match status {
                Ok(status) if status.success() => {
                    if spec.flavor == OutputFlavor::Mp4 {
                        let tmp = temp_output_path(&spec.work_dir, &spec.output_name);
                        let final_path = spec.work_dir.join(&spec.output_name);
                        match std::fs::rename(&tmp, &final_path) {
                            Ok(()) => Ok(BuildSuccess {
                                artifact_path: Some(final_path),
                            }),
                            Err(e) => Err(BuildFailure {
                                class: FailureClass::FfmpegFatal,
                                detail: format!("publish rename failed: {e}"),
                            }),
                        }
                    } else {
                        Ok(BuildSuccess {
                            artifact_path: None,
                        })
                    }
                }
                Ok(status) => {
                    let tail = diag_for_driver.lock().await.stderr_tail.clone();
                    let class = stop_class
                        .unwrap_or_else(|| classify_exit(&tail, segments_written));
                    warn!(key = %spec.key, ?class, %status, "build failed");
                    Err(BuildFailure {
                        class,
                        detail: format!("encoder exited with {status}"),
                    })
                }
                Err(e) => Err(BuildFailure {
                    class: FailureClass::FfmpegFatal,
                    detail: format!("wait failed: {e}"),
                }),
            };
            let _ = outcome_tx.send(outcome);
        });

        Ok(RunnerHandle::from_parts(
            outcome_rx,
            progress_rx,
            stop_tx,
            diagnostics,
        ))
    }
}

#[cfg(unix)]
async fn graceful_stop(child: &mut tokio::process::Child, grace: Duration) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

#[cfg(not(unix))]
async fn graceful_stop(child: &mut tokio::process::Child, _grace: Duration) {
    let _ = child.kill().await;
}
