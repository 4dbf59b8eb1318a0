use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub receiver: ReceiverConfig,

    #[serde(default)]
    pub vod: VodConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub intents: IntentsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub profiles: ProfilesConfig,

    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Server-side playback policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Whether the server is willing to transcode at all.
    #[serde(default = "default_true")]
    pub allow_transcode: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_transcode: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Secret for signing decision tokens. Generated at startup when absent.
    #[serde(default)]
    pub token_secret: Option<String>,

    /// Issuer / audience claims for decision tokens.
    #[serde(default = "default_token_issuer")]
    pub token_issuer: String,

    #[serde(default = "default_token_audience")]
    pub token_audience: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8089
}
fn default_token_issuer() -> String {
    "recast".to_string()
}
fn default_token_audience() -> String {
    "recast-playback".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth: AuthConfig::default(),
            token_secret: None,
            token_issuer: default_token_issuer(),
            token_audience: default_token_audience(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Enable authentication for the v3 API.
    #[serde(default)]
    pub enabled: bool,

    /// Bearer tokens with their granted scopes. `*` and `v3:*` imply all
    /// subordinate scopes.
    #[serde(default)]
    pub tokens: Vec<ApiToken>,

    /// Username for cookie login.
    #[serde(default)]
    pub username: Option<String>,

    /// Bcrypt hash of the password (generate with `recast hash-password`).
    #[serde(default)]
    pub password_hash: Option<String>,

    /// Session cookie timeout in hours (default: 24).
    #[serde(default = "default_session_timeout")]
    pub session_timeout_hours: u64,
}

fn default_session_timeout() -> u64 {
    24
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiToken {
    pub token: String,

    #[serde(default = "default_token_scopes")]
    pub scopes: Vec<String>,
}

fn default_token_scopes() -> Vec<String> {
    vec!["v3:read".to_string()]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReceiverConfig {
    /// Base URL of the receiver's HTTP API.
    #[serde(default = "default_receiver_url")]
    pub base_url: String,

    /// Request timeout against the receiver.
    #[serde(default = "default_receiver_timeout")]
    pub timeout_secs: u64,

    /// Optional basic-auth credentials.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_receiver_url() -> String {
    "http://127.0.0.1:80".to_string()
}
fn default_receiver_timeout() -> u64 {
    10
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            base_url: default_receiver_url(),
            timeout_secs: default_receiver_timeout(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VodConfig {
    /// Root under which per-recording HLS cache directories live.
    #[serde(default = "default_hls_root")]
    pub hls_root: PathBuf,

    /// Data directory for progressive MP4 outputs and scratch space.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Retry-After hint handed to clients while an artifact is preparing.
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u32,

    /// Cache entry TTL. Bounded from below by the eviction cadence.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Maximum cached entries before oldest-first eviction.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Free-space floor on the data directory before disk-pressure eviction.
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Build considered stalled when progress does not advance within this
    /// window.
    #[serde(default = "default_stall_secs")]
    pub stall_window_secs: u64,

    /// Grace period between stop signal and hard kill.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

fn default_hls_root() -> PathBuf {
    PathBuf::from("/var/lib/recast/hls")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/recast/data")
}
fn default_retry_after() -> u32 {
    3
}
fn default_cache_ttl() -> u64 {
    24 * 3600
}
fn default_cache_max_entries() -> usize {
    64
}
fn default_min_free_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}
fn default_stall_secs() -> u64 {
    45
}
fn default_stop_grace() -> u64 {
    5
}

impl Default for VodConfig {
    fn default() -> Self {
        Self {
            hls_root: default_hls_root(),
            data_dir: default_data_dir(),
            retry_after_secs: default_retry_after(),
            cache_ttl_secs: default_cache_ttl(),
            cache_max_entries: default_cache_max_entries(),
            min_free_bytes: default_min_free_bytes(),
            stall_window_secs: default_stall_secs(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// Worker count for the probe pool.
    #[serde(default = "default_probe_workers")]
    pub workers: usize,

    /// Bounded queue depth; enqueue attempts beyond this are rejected.
    #[serde(default = "default_probe_queue")]
    pub queue_size: usize,

    /// Per-probe timeout.
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

fn default_probe_workers() -> usize {
    8
}
fn default_probe_queue() -> usize {
    32
}
fn default_probe_timeout() -> u64 {
    15
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            workers: default_probe_workers(),
            queue_size: default_probe_queue(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    /// Whether the admission controller is wired at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Configured tuner slots. Zero means every start is rejected.
    #[serde(default = "default_tuner_slots")]
    pub tuner_slots: u32,

    /// Active-session cap.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,

    /// Cluster-level concurrent transcode budget.
    #[serde(default = "default_transcode_budget")]
    pub transcode_budget: u32,

    /// Default retry hint for retryable rejections.
    #[serde(default = "default_admission_retry")]
    pub retry_after_secs: u32,
}

fn default_true() -> bool {
    true
}
fn default_tuner_slots() -> u32 {
    2
}
fn default_max_sessions() -> u32 {
    16
}
fn default_transcode_budget() -> u32 {
    2
}
fn default_admission_retry() -> u32 {
    5
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tuner_slots: default_tuner_slots(),
            max_sessions: default_max_sessions(),
            transcode_budget: default_transcode_budget(),
            retry_after_secs: default_admission_retry(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntentsConfig {
    /// Allow direct-URL sources pointing at private/loopback/link-local
    /// addresses. Off by default.
    #[serde(default)]
    pub allow_private_destinations: bool,

    /// Session lease duration.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Heartbeat interval handed to clients.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u32,

    /// Default profile when neither an explicit profile nor a codec
    /// preference selects one.
    #[serde(default = "default_profile_name")]
    pub default_profile: String,

    /// Preflight timeout for source checks.
    #[serde(default = "default_preflight_timeout")]
    pub preflight_timeout_secs: u64,
}

fn default_lease_secs() -> u64 {
    90
}
fn default_heartbeat() -> u32 {
    30
}
fn default_profile_name() -> String {
    "universal".to_string()
}
fn default_preflight_timeout() -> u64 {
    5
}

impl Default for IntentsConfig {
    fn default() -> Self {
        Self {
            allow_private_destinations: false,
            lease_secs: default_lease_secs(),
            heartbeat_interval_secs: default_heartbeat(),
            default_profile: default_profile_name(),
            preflight_timeout_secs: default_preflight_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Paths to monitor (recording mounts, cache roots).
    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// Monitor interval.
    #[serde(default = "default_storage_interval")]
    pub interval_secs: u64,

    /// Per-probe child process timeout.
    #[serde(default = "default_storage_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Process-wide probe concurrency.
    #[serde(default = "default_storage_probe_slots")]
    pub max_concurrent_probes: usize,
}

fn default_storage_interval() -> u64 {
    30
}
fn default_storage_probe_timeout() -> u64 {
    2
}
fn default_storage_probe_slots() -> usize {
    8
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            interval_secs: default_storage_interval(),
            probe_timeout_secs: default_storage_probe_timeout(),
            max_concurrent_probes: default_storage_probe_slots(),
        }
    }
}

/// Named transcode/packaging profiles.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfilesConfig {
    /// Whether a hardware encoder was verified at startup.
    #[serde(default)]
    pub gpu_verified: bool,

    #[serde(default = "ProfilesConfig::builtin")]
    pub entries: BTreeMap<String, ProfileSpec>,
}

impl ProfilesConfig {
    /// Built-in profile set; a config file may extend or override it.
    pub fn builtin() -> BTreeMap<String, ProfileSpec> {
        let mut m = BTreeMap::new();
        m.insert(
            "universal".to_string(),
            ProfileSpec {
                container: "mp4".into(),
                video_codec: "h264".into(),
                audio_codec: "aac".into(),
                hw_accel: None,
                max_width: 1920,
                max_height: 1080,
                hls_segment_secs: 4,
            },
        );
        m.insert(
            "hevc-cpu".to_string(),
            ProfileSpec {
                container: "mp4".into(),
                video_codec: "hevc".into(),
                audio_codec: "aac".into(),
                hw_accel: None,
                max_width: 3840,
                max_height: 2160,
                hls_segment_secs: 4,
            },
        );
        m.insert(
            "hevc-gpu".to_string(),
            ProfileSpec {
                container: "mp4".into(),
                video_codec: "hevc".into(),
                audio_codec: "aac".into(),
                hw_accel: Some("nvenc".into()),
                max_width: 3840,
                max_height: 2160,
                hls_segment_secs: 4,
            },
        );
        m
    }

    /// Resolve a codec preference list (e.g. `av1,hevc,h264`) to a profile
    /// name, honouring GPU verification.
    pub fn for_codec_preference(&self, codecs: &str) -> Option<&str> {
        for codec in codecs.split(',').map(str::trim) {
            let (gpu, cpu) = match codec {
                "hevc" | "h265" => ("hevc-gpu", "hevc-cpu"),
                "h264" | "avc" => ("universal", "universal"),
                _ => continue,
            };
            let name = if self.gpu_verified { gpu } else { cpu };
            if self.entries.contains_key(name) {
                return Some(name);
            }
        }
        None
    }
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            gpu_verified: false,
            entries: Self::builtin(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProfileSpec {
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,

    /// Hardware acceleration (none, nvenc, qsv, videotoolbox).
    #[serde(default)]
    pub hw_accel: Option<String>,

    #[serde(default = "default_max_width")]
    pub max_width: u32,

    #[serde(default = "default_max_height")]
    pub max_height: u32,

    #[serde(default = "default_segment_secs")]
    pub hls_segment_secs: u32,
}

fn default_max_width() -> u32 {
    1920
}
fn default_max_height() -> u32 {
    1080
}
fn default_segment_secs() -> u32 {
    4
}
