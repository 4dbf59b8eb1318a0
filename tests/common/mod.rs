//! Shared test harness: an in-memory gateway with scripted collaborators.
//!
//! The harness wires the real router against a fake build runner, a counting
//! prober, and a counting event bus, rooted in a temp directory. Requests go
//! through `tower::ServiceExt::oneshot`, so the full middleware stack runs.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use recast::config::Config;
use recast::intents::IntentHandler;
use recast::probe::{Prober, StreamInfo};
use recast::server::{build_context, create_router, AppContext};
use recast::session::bus::{BroadcastBus, EventBus, SessionEvent};
use recast::storage::ProbeMode;
use recast::vod::runner::{
    BuildOutcome, BuildSpec, BuildSuccess, Runner, RunnerHandle, StopRequest,
};
use recast::vod::store;
use recast_common::{RecordingId, ServiceRef};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot, watch};
use tower::ServiceExt;

/// Prober that counts invocations and answers with a fixed TS/H.264 truth.
pub struct CountingProber {
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl CountingProber {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for CountingProber {
    async fn probe(&self, _path: &Path) -> recast_common::Result<StreamInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(StreamInfo {
            container: "ts".into(),
            video_codec: "h264".into(),
            audio_codec: "mp2".into(),
            width: Some(1920),
            height: Some(1080),
            fps: Some(50.0),
            duration_secs: Some(1800.0),
        })
    }
}

/// Bus wrapper counting successful publishes.
pub struct CountingBus {
    pub published: AtomicUsize,
    inner: BroadcastBus,
}

impl CountingBus {
    pub fn new() -> Self {
        Self {
            published: AtomicUsize::new(0),
            inner: BroadcastBus::new(64),
        }
    }

    pub fn count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
}

impl EventBus for CountingBus {
    fn publish(&self, event: SessionEvent) -> recast_common::Result<()> {
        self.inner.publish(event)?;
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Runner that immediately emits a successful HLS build into the work dir.
pub struct FakeRunner {
    pub starts: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            starts: AtomicUsize::new(0),
        }
    }
}

impl Runner for FakeRunner {
    fn start(&self, spec: BuildSpec) -> recast_common::Result<RunnerHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(&spec.work_dir)?;
        std::fs::write(
            spec.work_dir.join(store::LIVE_PLAYLIST),
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg_00001.ts\n",
        )?;
        std::fs::write(spec.work_dir.join("seg_00001.ts"), vec![0u8; 1024])?;

        let outcome: BuildOutcome = Ok(BuildSuccess {
            artifact_path: None,
        });
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (_progress_tx, progress_rx) = watch::channel(None);
        let (stop_tx, _stop_rx) = mpsc::channel::<StopRequest>(1);
        let _ = outcome_tx.send(outcome);
        Ok(RunnerHandle::from_parts(
            outcome_rx,
            progress_rx,
            stop_tx,
            Arc::new(tokio::sync::Mutex::new(Default::default())),
        ))
    }
}

pub struct TestHarness {
    pub ctx: AppContext,
    pub router: Router,
    pub prober: Arc<CountingProber>,
    pub bus: Arc<CountingBus>,
    pub runner: Arc<FakeRunner>,
    pub tmp: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config_and_probe_delay(Config::default(), Duration::from_millis(20))
    }

    pub fn with_probe_delay(delay: Duration) -> Self {
        Self::with_config_and_probe_delay(Config::default(), delay)
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_config_and_probe_delay(config, Duration::from_millis(20))
    }

    pub fn with_config_and_probe_delay(mut config: Config, probe_delay: Duration) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        config.vod.hls_root = tmp.path().join("hls");
        config.vod.data_dir = tmp.path().join("data");

        let prober = Arc::new(CountingProber::new(probe_delay));
        let runner = Arc::new(FakeRunner::new());
        let mut ctx = build_context(
            config,
            Arc::clone(&runner) as Arc<dyn Runner>,
            Arc::clone(&prober) as Arc<dyn Prober>,
            ProbeMode::InProcess,
        );

        // Swap in a counting bus so tests can assert publish behavior; the
        // intent handler must see the same bus.
        let bus = Arc::new(CountingBus::new());
        ctx.bus = Arc::clone(&bus) as Arc<dyn EventBus>;
        let admission = Arc::new(recast::admission::Controller::new(
            Some(Arc::new(recast::admission::ConfiguredStateSource {
                tuner_slots_total: ctx.config.admission.tuner_slots,
                session_cap: ctx.config.admission.max_sessions,
                transcode_budget_total: ctx.config.admission.transcode_budget,
                store: ctx.store.clone(),
            })),
            Arc::new(recast::admission::LogMetrics),
            ctx.config.admission.retry_after_secs,
        ));
        ctx.intents = Arc::new(IntentHandler::new(
            ctx.store.clone(),
            Arc::clone(&ctx.bus),
            admission,
            ctx.config.profiles.clone(),
            ctx.config.intents.clone(),
        ));

        let router = create_router(ctx.clone());
        Self {
            ctx,
            router,
            prober,
            bus,
            runner,
            tmp,
        }
    }

    /// A recording whose backing file exists inside the temp dir.
    pub fn recording(&self, name: &str) -> (ServiceRef, String) {
        let media_dir = self.tmp.path().join("media");
        std::fs::create_dir_all(&media_dir).unwrap();
        let file = media_dir.join(name);
        std::fs::write(&file, vec![0u8; 64]).unwrap();
        let sref = ServiceRef::parse(&format!(
            "1:0:19:283D:3FB:1:C00000:0:0:0:{}",
            file.display()
        ))
        .unwrap();
        let id = RecordingId::encode(&sref).to_string();
        (sref, id)
    }

    /// The cache directory the store derives for a reference.
    pub fn cache_dir(&self, sref: &ServiceRef) -> PathBuf {
        self.ctx.resolver.manager().store().cache_dir(sref)
    }

    /// Populate a final-ready HLS cache for a reference.
    pub fn seed_final_cache(&self, sref: &ServiceRef) -> PathBuf {
        let dir = self.cache_dir(sref);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(store::FINAL_PLAYLIST),
            "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:4.0,\nseg_00001.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap();
        std::fs::write(dir.join("seg_00001.ts"), vec![0u8; 4096]).unwrap();
        dir
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible")
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn head(&self, uri: &str) -> Response<Body> {
        self.send(Request::head(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn get_with_range(&self, uri: &str, range: &str) -> Response<Body> {
        self.send(
            Request::get(uri)
                .header("range", range)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        self.send(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }
}

/// Drain a response body into a JSON value.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

/// Drain a response body into a string.
pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}
