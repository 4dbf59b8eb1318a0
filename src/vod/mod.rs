//! VOD artifact pipeline.
//!
//! The manager owns every artifact lifecycle: it runs builds through the
//! [`runner::Runner`], watches their progress for stalls, finalizes HLS
//! outputs, and evicts cold cache entries. Resolvers only read; all state
//! transitions happen here. Entry metadata is copy-on-write behind a
//! reader/writer lock so readers never observe torn state.

pub mod playlist;
pub mod resolver;
pub mod runner;
pub mod store;

use parking_lot::{Mutex, RwLock};
use recast_common::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::VodConfig;
use crate::probe::{Prober, ProbeRegistry, StreamInfo};
use runner::{
    BuildSpec, FailureClass, OutputFlavor, Progress, Runner, RunnerHandle,
};
use store::ArtifactStore;

/// Fixed eviction cadence. TTLs shorter than this are raised to it.
pub const EVICTION_CADENCE: Duration = Duration::from_secs(600);
/// Bytes freed per disk-pressure eviction round.
const DISK_PRESSURE_FREE_TARGET: u64 = 1024 * 1024 * 1024;

/// Lifecycle of one (service-ref, profile) build key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Unknown,
    Preparing,
    Running,
    Finalizing,
    Ready,
    Failed,
}

/// Per-entry metadata. Cloned on every mutation; readers hold stable
/// snapshots.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub status: BuildStatus,
    pub profile: String,
    pub work_dir: PathBuf,
    pub playlist_path: Option<PathBuf>,
    pub artifact_path: Option<PathBuf>,
    pub updated_at: SystemTime,
    pub failure: Option<(FailureClass, String)>,
    /// Annotations from demotions (e.g. a READY entry whose file vanished).
    pub reasons: Vec<String>,
}

impl EntryMeta {
    fn new(profile: &str, work_dir: &Path) -> Self {
        Self {
            status: BuildStatus::Unknown,
            profile: profile.to_string(),
            work_dir: work_dir.to_path_buf(),
            playlist_path: None,
            artifact_path: None,
            updated_at: SystemTime::now(),
            failure: None,
            reasons: Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.status,
            BuildStatus::Preparing | BuildStatus::Running | BuildStatus::Finalizing
        )
    }
}

/// What an eviction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_ttl: usize,
    pub removed_max_entries: usize,
    pub remaining: usize,
}

struct VodInner {
    cfg: VodConfig,
    store: ArtifactStore,
    runner: Arc<dyn Runner>,
    prober: Arc<dyn Prober>,
    registry: Arc<ProbeRegistry>,
    entries: RwLock<HashMap<String, Arc<EntryMeta>>>,
    /// Keyed singleflight: cancellation token per in-flight build.
    builds: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct VodManager {
    inner: Arc<VodInner>,
}

impl VodManager {
    pub fn new(
        cfg: VodConfig,
        runner: Arc<dyn Runner>,
        prober: Arc<dyn Prober>,
        registry: Arc<ProbeRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let store = ArtifactStore::new(cfg.hls_root.clone());
        Self {
            inner: Arc::new(VodInner {
                cfg,
                store,
                runner,
                prober,
                registry,
                entries: RwLock::new(HashMap::new()),
                builds: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    pub fn config(&self) -> &VodConfig {
        &self.inner.cfg
    }

    /// Non-blocking metadata lookup.
    pub fn get(&self, key: &str) -> Option<Arc<EntryMeta>> {
        self.inner.entries.read().get(key).cloned()
    }

    /// Delegate a one-off probe to the prober.
    pub async fn probe(&self, path: &Path) -> Result<StreamInfo> {
        self.inner.prober.probe(path).await
    }

    /// Idempotently ensure a build for `spec.key` is running or complete.
    ///
    /// Terminal success on disk short-circuits to `Ready`. A retryable
    /// failure is atomically demoted to `Preparing` and exactly one reconcile
    /// build starts. Everything in between coalesces onto the in-flight
    /// build.
    pub fn ensure_spec(&self, spec: BuildSpec) -> BuildStatus {
        let key = spec.key.clone();

        if self.output_on_disk(&spec) {
            self.update_meta(&key, &spec, |meta| {
                meta.status = BuildStatus::Ready;
                meta.failure = None;
                if spec.flavor == OutputFlavor::Hls {
                    meta.playlist_path = Some(spec.work_dir.join(store::FINAL_PLAYLIST));
                } else {
                    meta.artifact_path = Some(spec.work_dir.join(&spec.output_name));
                }
            });
            return BuildStatus::Ready;
        }

        // Singleflight gate. Held only for the map operations.
        {
            let mut builds = self.inner.builds.lock();
            if builds.contains_key(&key) {
                return BuildStatus::Running;
            }

            if let Some(meta) = self.get(&key) {
                if meta.status == BuildStatus::Failed {
                    if let Some((class, _)) = &meta.failure {
                        if !class.retryable() {
                            return BuildStatus::Failed;
                        }
                    }
                }
            }

            self.update_meta(&key, &spec, |meta| {
                meta.status = BuildStatus::Preparing;
                meta.failure = None;
            });

            let token = self.inner.cancel.child_token();
            builds.insert(key.clone(), token.clone());
            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_build(spec, token).await;
            });
        }

        BuildStatus::Preparing
    }

    /// Demote a READY entry back to PREPARING, annotating why. The caller is
    /// expected to follow up with `ensure_spec` to reconcile.
    pub fn demote(&self, key: &str, reason: &str) {
        let mut entries = self.inner.entries.write();
        if let Some(existing) = entries.get(key) {
            let mut meta = (**existing).clone();
            meta.status = BuildStatus::Preparing;
            meta.failure = None;
            if !meta.reasons.iter().any(|r| r == reason) {
                meta.reasons.push(reason.to_string());
            }
            meta.updated_at = SystemTime::now();
            warn!(key, reason, "entry demoted to preparing");
            entries.insert(key.to_string(), Arc::new(meta));
        }
    }

    /// Evict on age and entry count. Active entries are never touched.
    pub fn prune_metadata(
        &self,
        now: SystemTime,
        ttl: Duration,
        max_entries: usize,
    ) -> PruneReport {
        let mut report = PruneReport::default();
        let mut victims: Vec<(String, PathBuf)> = Vec::new();

        {
            let mut entries = self.inner.entries.write();

            // Age pass.
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, m)| !m.is_active())
                .filter(|(_, m)| {
                    now.duration_since(m.updated_at)
                        .map(|age| age > ttl)
                        .unwrap_or(false)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(meta) = entries.remove(&key) {
                    victims.push((key, meta.work_dir.clone()));
                    report.removed_ttl += 1;
                }
            }

            // Count pass: oldest first among the non-active.
            if entries.len() > max_entries {
                let mut candidates: Vec<(String, SystemTime, PathBuf)> = entries
                    .iter()
                    .filter(|(_, m)| !m.is_active())
                    .map(|(k, m)| (k.clone(), m.updated_at, m.work_dir.clone()))
                    .collect();
                candidates.sort_by_key(|(_, at, _)| *at);
                let excess = entries.len() - max_entries;
                for (key, _, dir) in candidates.into_iter().take(excess) {
                    entries.remove(&key);
                    victims.push((key, dir));
                    report.removed_max_entries += 1;
                }
            }

            report.remaining = entries.len();
        }

        for (key, dir) in victims {
            self.inner.registry.forget(&key);
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key, error = %e, "failed to remove evicted cache dir");
                }
            }
        }

        report
    }

    /// Cancel every in-flight build.
    pub fn cancel_all(&self) {
        let builds = self.inner.builds.lock();
        for (key, token) in builds.iter() {
            debug!(key, "cancelling build");
            token.cancel();
        }
    }

    /// Periodic eviction driver. The configured TTL is bounded from below by
    /// the cadence.
    pub async fn run_eviction_loop(self) {
        let configured = Duration::from_secs(self.inner.cfg.cache_ttl_secs);
        let effective_ttl = if configured < EVICTION_CADENCE {
            warn!(
                configured_secs = configured.as_secs(),
                cadence_secs = EVICTION_CADENCE.as_secs(),
                "configured cache TTL is below the eviction cadence; using the cadence"
            );
            EVICTION_CADENCE
        } else {
            configured
        };

        let mut interval = tokio::time::interval(EVICTION_CADENCE);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.inner.cancel.cancelled() => break,
            }
            let report = self.prune_metadata(
                SystemTime::now(),
                effective_ttl,
                self.inner.cfg.cache_max_entries,
            );
            if report.removed_ttl > 0 || report.removed_max_entries > 0 {
                info!(?report, "cache eviction pass");
            }
            self.evict_for_disk_pressure();
        }
    }

    /// Free space when the data directory drops below the configured floor.
    pub fn evict_for_disk_pressure(&self) {
        let Some(free) = free_space(&self.inner.cfg.data_dir) else {
            return;
        };
        if free >= self.inner.cfg.min_free_bytes {
            return;
        }
        info!(
            free_bytes = free,
            floor = self.inner.cfg.min_free_bytes,
            "disk pressure: evicting oldest cache entries"
        );

        let mut candidates: Vec<(String, SystemTime, PathBuf)> = {
            let entries = self.inner.entries.read();
            entries
                .iter()
                .filter(|(_, m)| !m.is_active())
                .map(|(k, m)| (k.clone(), m.updated_at, m.work_dir.clone()))
                .collect()
        };
        candidates.sort_by_key(|(_, at, _)| *at);

        let mut freed: u64 = 0;
        for (key, _, dir) in candidates {
            if freed >= DISK_PRESSURE_FREE_TARGET {
                break;
            }
            let size = dir_size(&dir);
            {
                let mut entries = self.inner.entries.write();
                entries.remove(&key);
            }
            self.inner.registry.forget(&key);
            if std::fs::remove_dir_all(&dir).is_ok() {
                freed = freed.saturating_add(size);
            }
        }
        info!(freed_bytes = freed, "disk pressure eviction complete");
    }

    fn output_on_disk(&self, spec: &BuildSpec) -> bool {
        match spec.flavor {
            OutputFlavor::Hls => self.inner.store.final_ready(&spec.work_dir),
            OutputFlavor::Mp4 => spec.work_dir.join(&spec.output_name).is_file(),
        }
    }

    fn update_meta<F: FnOnce(&mut EntryMeta)>(&self, key: &str, spec: &BuildSpec, f: F) {
        let mut entries = self.inner.entries.write();
        let mut meta = entries
            .get(key)
            .map(|m| (**m).clone())
            .unwrap_or_else(|| EntryMeta::new(&spec.profile.video_codec, &spec.work_dir));
        meta.work_dir = spec.work_dir.clone();
        f(&mut meta);
        meta.updated_at = SystemTime::now();
        entries.insert(key.to_string(), Arc::new(meta));
    }

    fn set_status(&self, key: &str, status: BuildStatus, failure: Option<(FailureClass, String)>) {
        let mut entries = self.inner.entries.write();
        if let Some(existing) = entries.get(key) {
            let mut meta = (**existing).clone();
            meta.status = status;
            meta.failure = failure;
            meta.updated_at = SystemTime::now();
            entries.insert(key.to_string(), Arc::new(meta));
        }
    }

    async fn run_build(self, spec: BuildSpec, token: CancellationToken) {
        let key = spec.key.clone();
        let grace = Duration::from_secs(self.inner.cfg.stop_grace_secs);

        let handle = match self.inner.runner.start(spec.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                error!(key, error = %e, "runner failed to start");
                self.set_status(
                    &key,
                    BuildStatus::Failed,
                    Some((FailureClass::FfmpegFatal, e.to_string())),
                );
                self.inner.builds.lock().remove(&key);
                return;
            }
        };
        self.set_status(&key, BuildStatus::Running, None);

        let outcome = self.monitor_build(handle, &token, grace).await;

        match outcome {
            MonitorOutcome::Success => {
                if spec.flavor == OutputFlavor::Hls {
                    self.set_status(&key, BuildStatus::Finalizing, None);
                    match finalize_hls(&spec.work_dir) {
                        Ok(playlist_path) => {
                            self.update_meta(&key, &spec, |meta| {
                                meta.status = BuildStatus::Ready;
                                meta.playlist_path = Some(playlist_path.clone());
                                meta.failure = None;
                            });
                            info!(key, "build ready");
                        }
                        Err(e) => {
                            error!(key, error = %e, "finalize failed");
                            self.set_status(
                                &key,
                                BuildStatus::Failed,
                                Some((FailureClass::FfmpegFatal, e.to_string())),
                            );
                        }
                    }
                } else {
                    self.update_meta(&key, &spec, |meta| {
                        meta.status = BuildStatus::Ready;
                        meta.artifact_path = Some(spec.work_dir.join(&spec.output_name));
                        meta.failure = None;
                    });
                    info!(key, "build ready");
                }
            }
            MonitorOutcome::Failed(class, detail) => {
                warn!(key, ?class, detail, "build failed");
                self.set_status(&key, BuildStatus::Failed, Some((class, detail)));
            }
        }

        self.inner.builds.lock().remove(&key);
    }

    async fn monitor_build(
        &self,
        mut handle: RunnerHandle,
        token: &CancellationToken,
        grace: Duration,
    ) -> MonitorOutcome {
        let stall_window = Duration::from_secs(self.inner.cfg.stall_window_secs.max(1));
        let stopper = handle.stopper();
        let mut progress_rx = handle.progress();
        let mut progress_open = true;
        let mut last_sample = Progress::default();
        let mut last_advance = tokio::time::Instant::now();
        let mut stalled = false;
        let mut cancelled = false;

        loop {
            tokio::select! {
                outcome = handle.wait() => {
                    return match outcome {
                        Ok(_) => MonitorOutcome::Success,
                        Err(failure) => {
                            let class = if stalled {
                                FailureClass::Stalled
                            } else if cancelled {
                                FailureClass::Cancelled
                            } else {
                                failure.class
                            };
                            MonitorOutcome::Failed(class, failure.detail)
                        }
                    };
                }
                changed = progress_rx.changed(), if progress_open => {
                    match changed {
                        Ok(()) => {
                            if let Some(sample) = *progress_rx.borrow_and_update() {
                                if sample.advanced_over(&last_sample) {
                                    last_advance = tokio::time::Instant::now();
                                }
                                last_sample = sample;
                            }
                        }
                        Err(_) => progress_open = false,
                    }
                }
                _ = tokio::time::sleep_until(last_advance + stall_window), if !stalled && !cancelled => {
                    warn!("build stalled; stopping");
                    stalled = true;
                    stopper.stop(grace).await;
                }
                _ = token.cancelled(), if !cancelled && !stalled => {
                    cancelled = true;
                    stopper.stop(grace).await;
                }
            }
        }
    }
}

enum MonitorOutcome {
    Success,
    Failed(FailureClass, String),
}

/// Finalize an HLS build: rewrite the live playlist as VOD, publish it
/// atomically, and drop the live playlist.
fn finalize_hls(work_dir: &Path) -> std::io::Result<PathBuf> {
    let live = work_dir.join(store::LIVE_PLAYLIST);
    let content = std::fs::read_to_string(&live)?;
    let rewritten = playlist::rewrite(&content, playlist::PlaylistType::Vod);

    let tmp = work_dir.join(store::FINAL_TMP);
    let final_path = work_dir.join(store::FINAL_PLAYLIST);
    std::fs::write(&tmp, rewritten)?;
    std::fs::rename(&tmp, &final_path)?;
    std::fs::remove_file(&live)?;
    Ok(final_path)
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(unix)]
fn free_space(path: &Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    Some(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfilesConfig;
    use crate::probe::pool::ProbeRegistry;
    use async_trait::async_trait;
    use runner::{BuildFailure, BuildOutcome, BuildSuccess, SourceKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::{mpsc, oneshot, watch};

    /// Runner whose outcome is scripted per start() call.
    struct FakeRunner {
        starts: AtomicUsize,
        script: Box<dyn Fn(&BuildSpec) -> BuildOutcome + Send + Sync>,
        delay: Duration,
    }

    impl FakeRunner {
        fn new(
            delay: Duration,
            script: impl Fn(&BuildSpec) -> BuildOutcome + Send + Sync + 'static,
        ) -> Self {
            Self {
                starts: AtomicUsize::new(0),
                script: Box::new(script),
                delay,
            }
        }
    }

    impl Runner for FakeRunner {
        fn start(&self, spec: BuildSpec) -> Result<RunnerHandle> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let outcome = (self.script)(&spec);
            let delay = self.delay;
            let (outcome_tx, outcome_rx) = oneshot::channel();
            let (_progress_tx, progress_rx) = watch::channel(None);
            let (stop_tx, mut stop_rx) = mpsc::channel::<runner::StopRequest>(1);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let _ = outcome_tx.send(outcome);
                    }
                    Some(_) = stop_rx.recv() => {
                        let _ = outcome_tx.send(Err(BuildFailure {
                            class: FailureClass::Cancelled,
                            detail: "stopped".into(),
                        }));
                    }
                }
            });
            Ok(RunnerHandle::from_parts(
                outcome_rx,
                progress_rx,
                stop_tx,
                Arc::new(tokio::sync::Mutex::new(runner::Diagnostics::default())),
            ))
        }
    }

    struct NoProber;

    #[async_trait]
    impl Prober for NoProber {
        async fn probe(&self, _path: &Path) -> Result<StreamInfo> {
            Ok(StreamInfo::default())
        }
    }

    fn hls_success_script(spec: &BuildSpec) -> BuildOutcome {
        // Emulate what ffmpeg leaves behind on success.
        std::fs::create_dir_all(&spec.work_dir).unwrap();
        std::fs::write(
            spec.work_dir.join(store::LIVE_PLAYLIST),
            "#EXTM3U\n#EXTINF:4.0,\nseg_00001.ts\n",
        )
        .unwrap();
        std::fs::write(spec.work_dir.join("seg_00001.ts"), "data").unwrap();
        Ok(BuildSuccess {
            artifact_path: None,
        })
    }

    fn manager_with(runner: Arc<FakeRunner>, root: &Path) -> VodManager {
        let cfg = VodConfig {
            hls_root: root.to_path_buf(),
            data_dir: root.to_path_buf(),
            stall_window_secs: 30,
            ..Default::default()
        };
        VodManager::new(
            cfg,
            runner,
            Arc::new(NoProber),
            Arc::new(ProbeRegistry::new()),
            CancellationToken::new(),
        )
    }

    fn spec_for(root: &Path, key: &str) -> BuildSpec {
        BuildSpec {
            key: key.to_string(),
            source: SourceKind::File(PathBuf::from("/media/hdd/in.ts")),
            work_dir: root.join("recordings").join(key),
            output_name: store::MP4_OUTPUT.into(),
            profile: ProfilesConfig::builtin().get("universal").cloned().unwrap(),
            flavor: OutputFlavor::Hls,
        }
    }

    async fn wait_for_status(manager: &VodManager, key: &str, status: BuildStatus) {
        for _ in 0..400 {
            if manager.get(key).map(|m| m.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "status never became {status:?}: {:?}",
            manager.get(key).map(|m| m.status)
        );
    }

    #[tokio::test]
    async fn test_build_reaches_ready_and_finalizes() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(10), hls_success_script));
        let manager = manager_with(Arc::clone(&runner), tmp.path());
        let spec = spec_for(tmp.path(), "k1");

        let status = manager.ensure_spec(spec.clone());
        assert_eq!(status, BuildStatus::Preparing);
        wait_for_status(&manager, "k1", BuildStatus::Ready).await;

        // Finalization rewrote and published the playlist.
        let final_playlist = spec.work_dir.join(store::FINAL_PLAYLIST);
        let content = std::fs::read_to_string(&final_playlist).unwrap();
        assert!(content.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
        assert!(content.contains("#EXT-X-ENDLIST"));
        assert!(!spec.work_dir.join(store::LIVE_PLAYLIST).exists());

        // A later ensure_spec short-circuits off disk without a new build.
        assert_eq!(manager.ensure_spec(spec), BuildStatus::Ready);
        assert_eq!(runner.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_singleflight_coalesces() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(200), hls_success_script));
        let manager = manager_with(Arc::clone(&runner), tmp.path());
        let spec = spec_for(tmp.path(), "k1");

        let first = manager.ensure_spec(spec.clone());
        assert_eq!(first, BuildStatus::Preparing);
        for _ in 0..10 {
            let again = manager.ensure_spec(spec.clone());
            assert!(matches!(again, BuildStatus::Running));
        }
        wait_for_status(&manager, "k1", BuildStatus::Ready).await;
        assert_eq!(runner.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nonretryable_failure_sticks() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(5), |_| {
            Err(BuildFailure {
                class: FailureClass::SourceUnavailable,
                detail: "404".into(),
            })
        }));
        let manager = manager_with(Arc::clone(&runner), tmp.path());
        let spec = spec_for(tmp.path(), "k1");

        manager.ensure_spec(spec.clone());
        wait_for_status(&manager, "k1", BuildStatus::Failed).await;

        // Non-retryable failures never re-enter the singleflight.
        assert_eq!(manager.ensure_spec(spec), BuildStatus::Failed);
        assert_eq!(runner.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_reconciles_once() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(5), |_| {
            Err(BuildFailure {
                class: FailureClass::ProbeFailed,
                detail: "bad input".into(),
            })
        }));
        let manager = manager_with(Arc::clone(&runner), tmp.path());
        let spec = spec_for(tmp.path(), "k1");

        manager.ensure_spec(spec.clone());
        wait_for_status(&manager, "k1", BuildStatus::Failed).await;

        // A retryable failure demotes and rebuilds.
        let status = manager.ensure_spec(spec);
        assert_eq!(status, BuildStatus::Preparing);
        wait_for_status(&manager, "k1", BuildStatus::Failed).await;
        assert_eq!(runner.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_demote_annotates_reason() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(5), hls_success_script));
        let manager = manager_with(runner, tmp.path());
        let spec = spec_for(tmp.path(), "k1");

        manager.ensure_spec(spec);
        wait_for_status(&manager, "k1", BuildStatus::Ready).await;

        manager.demote("k1", "playlist_open_failed");
        let meta = manager.get("k1").unwrap();
        assert_eq!(meta.status, BuildStatus::Preparing);
        assert_eq!(meta.reasons, vec!["playlist_open_failed".to_string()]);

        // Demoting twice does not duplicate the annotation.
        manager.demote("k1", "playlist_open_failed");
        assert_eq!(manager.get("k1").unwrap().reasons.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_ttl_and_count() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(Duration::from_millis(5), hls_success_script));
        let manager = manager_with(runner, tmp.path());

        for key in ["a", "b", "c"] {
            manager.ensure_spec(spec_for(tmp.path(), key));
            wait_for_status(&manager, key, BuildStatus::Ready).await;
        }

        // Nothing is old enough for the TTL pass.
        let report = manager.prune_metadata(
            SystemTime::now(),
            Duration::from_secs(3600),
            10,
        );
        assert_eq!(report.removed_ttl, 0);
        assert_eq!(report.remaining, 3);

        // Count pass trims to the cap, oldest first.
        let report = manager.prune_metadata(SystemTime::now(), Duration::from_secs(3600), 1);
        assert_eq!(report.removed_max_entries, 2);
        assert_eq!(report.remaining, 1);

        // TTL pass removes everything once aged.
        let future = SystemTime::now() + Duration::from_secs(7200);
        let report = manager.prune_metadata(future, Duration::from_secs(3600), 10);
        assert_eq!(report.removed_ttl, 1);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn test_prune_spares_active_builds() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(Duration::from_secs(60), hls_success_script));
        let manager = manager_with(runner, tmp.path());

        manager.ensure_spec(spec_for(tmp.path(), "busy"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let future = SystemTime::now() + Duration::from_secs(7200);
        let report = manager.prune_metadata(future, Duration::from_secs(1), 0);
        assert_eq!(report.removed_ttl, 0);
        assert_eq!(report.removed_max_entries, 0);
        assert_eq!(report.remaining, 1);

        manager.cancel_all();
    }

    #[tokio::test]
    async fn test_cancel_all_stops_builds() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(Duration::from_secs(60), hls_success_script));
        let manager = manager_with(runner, tmp.path());

        manager.ensure_spec(spec_for(tmp.path(), "k1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.cancel_all();
        wait_for_status(&manager, "k1", BuildStatus::Failed).await;
        let meta = manager.get("k1").unwrap();
        assert_eq!(meta.failure.as_ref().unwrap().0, FailureClass::Cancelled);
    }

    #[test]
    fn test_finalize_hls_writes_final_atomically() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(store::LIVE_PLAYLIST),
            "#EXTM3U\n#EXT-X-DISCONTINUITY\n#EXTINF:4.0,\nseg_00001.ts\n",
        )
        .unwrap();
        let final_path = finalize_hls(tmp.path()).unwrap();
        let content = std::fs::read_to_string(final_path).unwrap();
        assert!(content.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
        assert!(!content.contains("DISCONTINUITY"));
        assert!(!tmp.path().join(store::LIVE_PLAYLIST).exists());
        assert!(!tmp.path().join(store::FINAL_TMP).exists());
    }
}
