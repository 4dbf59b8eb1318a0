//! Artifact resolver.
//!
//! Translates HTTP-level requests for playlists, segments, and progressive
//! MP4s into artifact lookups with preparing/retry semantics. The resolver
//! never blocks on a build: a miss kicks the manager and reports
//! `Preparing`. It holds a one-way reference to the manager and only reads
//! its state; transitions stay inside the manager.

use recast_common::{RecordingId, ServiceRef};
use std::path::PathBuf;

use super::playlist::{self, PlaylistType};
use super::runner::{BuildSpec, OutputFlavor, SourceKind};
use super::store::{self, Artifact, ArtifactBody, ArtifactKind};
use super::{BuildStatus, VodManager};
use crate::config::{ProfileSpec, ProfilesConfig};

pub const PLAYLIST_MIME: &str = "application/vnd.apple.mpegurl";
pub const MP4_MIME: &str = "video/mp4";

/// Resolver-level failure, mapped to problems at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    /// A build is running (or was just started); retry after the hint.
    Preparing { retry_after_secs: u32 },
    NotFound,
    Invalid(String),
    Internal(String),
}

pub type ArtifactResult = std::result::Result<Artifact, ArtifactError>;

pub struct ArtifactResolver {
    manager: VodManager,
    profiles: ProfilesConfig,
    default_profile: String,
}

impl ArtifactResolver {
    pub fn new(manager: VodManager, profiles: ProfilesConfig, default_profile: String) -> Self {
        Self {
            manager,
            profiles,
            default_profile,
        }
    }

    pub fn manager(&self) -> &VodManager {
        &self.manager
    }

    /// Resolve the VOD playlist for a recording.
    pub fn resolve_playlist(&self, recording_id: &str, profile: Option<&str>) -> ArtifactResult {
        let sref = decode(recording_id)?;
        let (profile_name, profile_spec) = self.profile_for(profile)?;
        let dir = self.manager.store().cache_dir(&sref);
        let key = build_key(&sref, profile_name);

        if self.manager.store().final_ready(&dir) {
            let path = dir.join(store::FINAL_PLAYLIST);
            match std::fs::read(&path) {
                Ok(data) => {
                    let mod_time = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
                    return Ok(Artifact {
                        kind: ArtifactKind::Playlist,
                        body: ArtifactBody::Inline(data.into()),
                        mod_time,
                        mime: PLAYLIST_MIME,
                    });
                }
                Err(_) => {
                    // Metadata (and the readiness probe) said READY but the
                    // playlist cannot be opened: demote and reconcile.
                    self.manager.demote(&key, "playlist_open_failed");
                    self.manager
                        .ensure_spec(self.build_spec(&sref, &key, &dir, profile_spec, OutputFlavor::Hls));
                    return Err(self.preparing());
                }
            }
        }

        if self.manager.store().progressive_ready(&dir) {
            return Ok(Artifact {
                kind: ArtifactKind::Playlist,
                body: ArtifactBody::File(dir.join(store::LIVE_PLAYLIST)),
                mod_time: None,
                mime: PLAYLIST_MIME,
            });
        }

        match self
            .manager
            .ensure_spec(self.build_spec(&sref, &key, &dir, profile_spec, OutputFlavor::Hls))
        {
            BuildStatus::Ready => self.resolve_final_only(&dir),
            // Non-retryable failures surface immediately and never re-enter
            // the singleflight.
            BuildStatus::Failed => Err(self.terminal_failure(&key)),
            // Non-blocking by contract: everything else is "come back later".
            _ => Err(self.preparing()),
        }
    }

    /// Resolve the timeshift playlist: progressive first, rewritten as EVENT.
    pub fn resolve_timeshift(&self, recording_id: &str, profile: Option<&str>) -> ArtifactResult {
        let sref = decode(recording_id)?;
        let (profile_name, profile_spec) = self.profile_for(profile)?;
        let dir = self.manager.store().cache_dir(&sref);
        let key = build_key(&sref, profile_name);

        if self.manager.store().progressive_ready(&dir) {
            let path = dir.join(store::LIVE_PLAYLIST);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    let rewritten = playlist::rewrite(&content, PlaylistType::Event);
                    return Ok(Artifact {
                        kind: ArtifactKind::Timeshift,
                        body: ArtifactBody::Inline(rewritten.into_bytes().into()),
                        mod_time: None,
                        mime: PLAYLIST_MIME,
                    });
                }
                Err(_) => {
                    self.manager.demote(&key, "playlist_open_failed");
                }
            }
        }

        if self.manager.store().final_ready(&dir) {
            return self.resolve_final_only(&dir).map(|mut artifact| {
                artifact.kind = ArtifactKind::Timeshift;
                artifact
            });
        }

        match self
            .manager
            .ensure_spec(self.build_spec(&sref, &key, &dir, profile_spec, OutputFlavor::Hls))
        {
            BuildStatus::Failed => Err(self.terminal_failure(&key)),
            _ => Err(self.preparing()),
        }
    }

    /// Resolve a media segment, confined to the cache directory.
    pub fn resolve_segment(&self, recording_id: &str, segment: &str) -> ArtifactResult {
        let sref = decode(recording_id)?;
        let dir = self.manager.store().cache_dir(&sref);

        let (kind, mime) = store::segment_kind(segment)
            .filter(|_| store::segment_name_allowed(segment))
            .ok_or_else(|| ArtifactError::Invalid(format!("segment name not allowed: {segment}")))?;

        let path = store::confine_segment(&dir, segment).ok_or(ArtifactError::NotFound)?;
        let meta = std::fs::metadata(&path).map_err(|_| ArtifactError::NotFound)?;
        if !meta.is_file() {
            return Err(ArtifactError::NotFound);
        }

        Ok(Artifact {
            kind,
            body: ArtifactBody::File(path),
            mod_time: meta.modified().ok(),
            mime,
        })
    }

    /// Resolve the progressive MP4 for direct playback.
    pub fn resolve_mp4(&self, recording_id: &str, profile: Option<&str>) -> ArtifactResult {
        let sref = decode(recording_id)?;
        let (profile_name, profile_spec) = self.profile_for(profile)?;
        let dir = self.manager.store().cache_dir(&sref);
        let key = format!("{}:mp4", build_key(&sref, profile_name));

        let path = dir.join(store::MP4_OUTPUT);
        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.is_file() {
                return Ok(Artifact {
                    kind: ArtifactKind::Mp4,
                    body: ArtifactBody::File(path),
                    mod_time: meta.modified().ok(),
                    mime: MP4_MIME,
                });
            }
        }

        match self
            .manager
            .ensure_spec(self.build_spec(&sref, &key, &dir, profile_spec, OutputFlavor::Mp4))
        {
            BuildStatus::Failed => Err(self.terminal_failure(&key)),
            _ => Err(self.preparing()),
        }
    }

    fn resolve_final_only(&self, dir: &std::path::Path) -> ArtifactResult {
        let path = dir.join(store::FINAL_PLAYLIST);
        let data = std::fs::read(&path).map_err(|e| ArtifactError::Internal(e.to_string()))?;
        let mod_time = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        Ok(Artifact {
            kind: ArtifactKind::Playlist,
            body: ArtifactBody::Inline(data.into()),
            mod_time,
            mime: PLAYLIST_MIME,
        })
    }

    fn profile_for(&self, name: Option<&str>) -> Result<(&str, &ProfileSpec), ArtifactError> {
        let name = name.unwrap_or(&self.default_profile);
        self.profiles
            .entries
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ArtifactError::Invalid(format!("unknown profile: {name}")))
    }

    fn build_spec(
        &self,
        sref: &ServiceRef,
        key: &str,
        dir: &std::path::Path,
        profile: &ProfileSpec,
        flavor: OutputFlavor,
    ) -> BuildSpec {
        BuildSpec {
            key: key.to_string(),
            source: SourceKind::File(PathBuf::from(sref.path())),
            work_dir: dir.to_path_buf(),
            output_name: store::MP4_OUTPUT.to_string(),
            profile: profile.clone(),
            flavor,
        }
    }

    fn preparing(&self) -> ArtifactError {
        ArtifactError::Preparing {
            retry_after_secs: self.manager.config().retry_after_secs.max(1),
        }
    }

    /// Map a terminally failed build to its client-visible error.
    fn terminal_failure(&self, key: &str) -> ArtifactError {
        use super::runner::FailureClass;
        match self.manager.get(key).and_then(|m| m.failure.clone()) {
            Some((FailureClass::SourceUnavailable, detail)) => {
                tracing::warn!(key, detail, "source unavailable");
                ArtifactError::NotFound
            }
            Some((_, detail)) => ArtifactError::Internal(detail),
            None => ArtifactError::Internal("build failed".to_string()),
        }
    }
}

fn decode(recording_id: &str) -> Result<ServiceRef, ArtifactError> {
    RecordingId::decode(recording_id).map_err(|e| ArtifactError::Invalid(e.to_string()))
}

fn build_key(sref: &ServiceRef, profile: &str) -> String {
    format!("{}:{}", sref.digest(), profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VodConfig;
    use crate::probe::pool::ProbeRegistry;
    use crate::probe::{Prober, StreamInfo};
    use crate::vod::runner::{
        BuildFailure, BuildOutcome, BuildSuccess, FailureClass, Runner, RunnerHandle, StopRequest,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, oneshot, watch};
    use tokio_util::sync::CancellationToken;

    struct InstantRunner {
        starts: AtomicUsize,
        succeed: bool,
    }

    impl Runner for InstantRunner {
        fn start(&self, spec: BuildSpec) -> recast_common::Result<RunnerHandle> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let outcome: BuildOutcome = if self.succeed {
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
            } else {
                Err(BuildFailure {
                    class: FailureClass::ProbeFailed,
                    detail: "nope".into(),
                })
            };
            let (outcome_tx, outcome_rx) = oneshot::channel();
            let (_ptx, prx) = watch::channel(None);
            let (stop_tx, _stop_rx) = mpsc::channel::<StopRequest>(1);
            let _ = outcome_tx.send(outcome);
            Ok(RunnerHandle::from_parts(
                outcome_rx,
                prx,
                stop_tx,
                Arc::new(tokio::sync::Mutex::new(Default::default())),
            ))
        }
    }

    struct NoProber;

    #[async_trait]
    impl Prober for NoProber {
        async fn probe(&self, _path: &Path) -> recast_common::Result<StreamInfo> {
            Ok(StreamInfo::default())
        }
    }

    fn resolver_with(root: &Path, succeed: bool) -> (ArtifactResolver, Arc<InstantRunner>) {
        let runner = Arc::new(InstantRunner {
            starts: AtomicUsize::new(0),
            succeed,
        });
        let cfg = VodConfig {
            hls_root: root.to_path_buf(),
            data_dir: root.to_path_buf(),
            retry_after_secs: 3,
            ..Default::default()
        };
        let manager = VodManager::new(
            cfg,
            Arc::clone(&runner) as Arc<dyn Runner>,
            Arc::new(NoProber),
            Arc::new(ProbeRegistry::new()),
            CancellationToken::new(),
        );
        (
            ArtifactResolver::new(manager, ProfilesConfig::default(), "universal".into()),
            runner,
        )
    }

    fn recording_id() -> String {
        let sref =
            ServiceRef::parse("1:0:19:283D:3FB:1:C00000:0:0:0:/media/hdd/movie/show.ts").unwrap();
        RecordingId::encode(&sref).to_string()
    }

    fn cache_dir(resolver: &ArtifactResolver) -> std::path::PathBuf {
        let sref =
            ServiceRef::parse("1:0:19:283D:3FB:1:C00000:0:0:0:/media/hdd/movie/show.ts").unwrap();
        resolver.manager().store().cache_dir(&sref)
    }

    const READY_PLAYLIST: &str =
        "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:4.0,\nseg_00001.ts\n#EXT-X-ENDLIST\n";

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let tmp = TempDir::new().unwrap();
        let (resolver, _) = resolver_with(tmp.path(), true);
        assert!(matches!(
            resolver.resolve_playlist("!!!", None),
            Err(ArtifactError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_cold_cache_returns_preparing_and_triggers_build() {
        let tmp = TempDir::new().unwrap();
        let (resolver, runner) = resolver_with(tmp.path(), true);

        let err = resolver.resolve_playlist(&recording_id(), None).unwrap_err();
        assert_eq!(err, ArtifactError::Preparing { retry_after_secs: 3 });
        // Give the spawned build a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(runner.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_final_ready_served_inline() {
        let tmp = TempDir::new().unwrap();
        let (resolver, runner) = resolver_with(tmp.path(), true);
        let dir = cache_dir(&resolver);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(store::FINAL_PLAYLIST), READY_PLAYLIST).unwrap();
        std::fs::write(dir.join("seg_00001.ts"), "data").unwrap();

        let artifact = resolver.resolve_playlist(&recording_id(), None).unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Playlist);
        assert_eq!(artifact.mime, PLAYLIST_MIME);
        match artifact.body {
            ArtifactBody::Inline(data) => {
                assert!(std::str::from_utf8(&data).unwrap().contains("#EXT-X-ENDLIST"));
            }
            ArtifactBody::File(_) => panic!("final playlist should be inline"),
        }
        assert_eq!(runner.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_progressive_served_by_path() {
        let tmp = TempDir::new().unwrap();
        let (resolver, _) = resolver_with(tmp.path(), true);
        let dir = cache_dir(&resolver);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(store::LIVE_PLAYLIST),
            "#EXTM3U\n#EXTINF:4.0,\nseg_00001.ts\n",
        )
        .unwrap();
        std::fs::write(dir.join("seg_00001.ts"), "data").unwrap();

        let artifact = resolver.resolve_playlist(&recording_id(), None).unwrap();
        match artifact.body {
            ArtifactBody::File(path) => assert!(path.ends_with(store::LIVE_PLAYLIST)),
            ArtifactBody::Inline(_) => panic!("progressive playlist should be a path"),
        }
    }

    #[tokio::test]
    async fn test_timeshift_rewrites_to_event() {
        let tmp = TempDir::new().unwrap();
        let (resolver, _) = resolver_with(tmp.path(), true);
        let dir = cache_dir(&resolver);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(store::LIVE_PLAYLIST),
            "#EXTM3U\n#EXTINF:4.0,\nseg_00001.ts\n",
        )
        .unwrap();
        std::fs::write(dir.join("seg_00001.ts"), "data").unwrap();

        let artifact = resolver.resolve_timeshift(&recording_id(), None).unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Timeshift);
        match artifact.body {
            ArtifactBody::Inline(data) => {
                let text = std::str::from_utf8(&data).unwrap();
                assert!(text.contains("#EXT-X-PLAYLIST-TYPE:EVENT"));
                assert!(!text.contains("#EXT-X-ENDLIST"));
            }
            ArtifactBody::File(_) => panic!("timeshift should be rewritten inline"),
        }
    }

    #[tokio::test]
    async fn test_segment_allow_list_and_confinement() {
        let tmp = TempDir::new().unwrap();
        let (resolver, _) = resolver_with(tmp.path(), true);
        let dir = cache_dir(&resolver);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("seg_00001.ts"), "data").unwrap();

        let ok = resolver.resolve_segment(&recording_id(), "seg_00001.ts").unwrap();
        assert_eq!(ok.kind, ArtifactKind::SegmentTs);
        assert!(ok.mod_time.is_some());

        assert!(matches!(
            resolver.resolve_segment(&recording_id(), "index.m3u8"),
            Err(ArtifactError::Invalid(_))
        ));
        assert!(matches!(
            resolver.resolve_segment(&recording_id(), "seg_99999.ts"),
            Err(ArtifactError::NotFound)
        ));
        assert!(matches!(
            resolver.resolve_segment(&recording_id(), "../seg_00001.ts"),
            Err(ArtifactError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_mp4_preparing_then_ready() {
        let tmp = TempDir::new().unwrap();
        let (resolver, _) = resolver_with(tmp.path(), true);
        let dir = cache_dir(&resolver);

        assert!(matches!(
            resolver.resolve_mp4(&recording_id(), None),
            Err(ArtifactError::Preparing { .. })
        ));

        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(store::MP4_OUTPUT), "mp4data").unwrap();
        let artifact = resolver.resolve_mp4(&recording_id(), None).unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Mp4);
        assert_eq!(artifact.mime, MP4_MIME);
    }

    #[tokio::test]
    async fn test_unknown_profile_rejected() {
        let tmp = TempDir::new().unwrap();
        let (resolver, _) = resolver_with(tmp.path(), true);
        assert!(matches!(
            resolver.resolve_playlist(&recording_id(), Some("nope")),
            Err(ArtifactError::Invalid(_))
        ));
    }
}
