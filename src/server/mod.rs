//! HTTP server assembly.
//!
//! The router is a thin dispatcher: every handler delegates to a subsystem
//! (resolver, intent handler, receiver client) and maps typed errors into
//! problems. Scope enforcement is method-based (GET/HEAD read, mutations
//! write, administrative paths admin); media paths require the session
//! cookie instead.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, Method, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod auth;
pub mod problem;
pub mod routes_intents;
pub mod routes_media;
pub mod routes_recordings;
pub mod routes_system;
pub mod routes_timers;

use crate::admission::{ConfiguredStateSource, Controller, LogMetrics};
use crate::config::Config;
use crate::intents::{IntentHandler, MAX_BODY_BYTES};
use crate::probe::{ProbePool, ProbeRegistry, Prober};
use crate::receiver::{ClientCache, ReceiverClient};
use crate::session::bus::{BroadcastBus, EventBus};
use crate::session::StateStore;
use crate::storage::{ProbeMode, StorageMonitor};
use crate::vod::resolver::ArtifactResolver;
use crate::vod::runner::Runner;
use crate::vod::VodManager;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: StateStore,
    pub bus: Arc<dyn EventBus>,
    pub intents: Arc<IntentHandler>,
    pub resolver: Arc<ArtifactResolver>,
    pub vod: VodManager,
    pub probe_pool: Arc<ProbePool>,
    pub registry: Arc<ProbeRegistry>,
    pub storage: StorageMonitor,
    pub receiver_cache: Arc<ClientCache>,
    /// Configuration epoch; bumped by `POST /system/refresh`.
    pub epoch: Arc<AtomicU64>,
    pub token_secret: Arc<Vec<u8>>,
    pub cancel: CancellationToken,
}

impl AppContext {
    /// Obtain the epoch-keyed receiver client.
    pub fn receiver_client(&self) -> recast_common::Result<Arc<ReceiverClient>> {
        self.receiver_cache
            .get(self.epoch.load(Ordering::SeqCst), &self.config.receiver)
    }
}

/// Wire the full context from a configuration plus the two external
/// collaborators (build runner and prober).
pub fn build_context(
    config: Config,
    runner: Arc<dyn Runner>,
    prober: Arc<dyn Prober>,
    storage_probe_mode: ProbeMode,
) -> AppContext {
    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let registry = Arc::new(ProbeRegistry::new());
    let probe_pool = Arc::new(ProbePool::new(
        Arc::clone(&prober),
        Arc::clone(&registry),
        config.probe.workers,
        config.probe.queue_size,
        Duration::from_secs(config.probe.timeout_secs),
        cancel.child_token(),
    ));

    let vod = VodManager::new(
        config.vod.clone(),
        runner,
        prober,
        Arc::clone(&registry),
        cancel.child_token(),
    );
    let resolver = Arc::new(ArtifactResolver::new(
        vod.clone(),
        config.profiles.clone(),
        config.intents.default_profile.clone(),
    ));

    let store = StateStore::new();
    let bus: Arc<dyn EventBus> = Arc::new(BroadcastBus::new(64));

    let admission = Arc::new(if config.admission.enabled {
        Controller::new(
            Some(Arc::new(ConfiguredStateSource {
                tuner_slots_total: config.admission.tuner_slots,
                session_cap: config.admission.max_sessions,
                transcode_budget_total: config.admission.transcode_budget,
                store: store.clone(),
            })),
            Arc::new(LogMetrics),
            config.admission.retry_after_secs,
        )
    } else {
        Controller::new(None, Arc::new(LogMetrics), config.admission.retry_after_secs)
    });

    let intents = Arc::new(IntentHandler::new(
        store.clone(),
        Arc::clone(&bus),
        admission,
        config.profiles.clone(),
        config.intents.clone(),
    ));

    let storage = StorageMonitor::new(
        config.storage.paths.clone(),
        Duration::from_secs(config.storage.probe_timeout_secs),
        config.storage.max_concurrent_probes,
        storage_probe_mode,
    );

    let token_secret = Arc::new(match &config.server.token_secret {
        Some(secret) => secret.as_bytes().to_vec(),
        None => {
            use rand::RngCore;
            let mut bytes = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        }
    });

    AppContext {
        config,
        store,
        bus,
        intents,
        resolver,
        vod,
        probe_pool,
        registry,
        storage,
        receiver_cache: Arc::new(ClientCache::new()),
        epoch: Arc::new(AtomicU64::new(1)),
        token_secret,
        cancel,
    }
}

/// Start the long-lived background workers.
pub fn spawn_background(ctx: &AppContext) {
    tokio::spawn(ctx.vod.clone().run_eviction_loop());
    tokio::spawn(ctx.storage.clone().run(
        Duration::from_secs(ctx.config.storage.interval_secs),
        ctx.cancel.child_token(),
    ));
    crate::session::start_expiry_task(ctx.store.clone(), 30);
}

/// Create the Axum router with all routes under `/api/v3`.
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let auth_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout));

    let api_routes = Router::new()
        .route("/recordings", get(routes_recordings::browse))
        .route(
            "/recordings/:id/stream-info",
            get(routes_recordings::stream_info_get).post(routes_recordings::stream_info_post),
        )
        .route("/intents", post(routes_intents::post_intent))
        .route(
            "/timers",
            get(routes_timers::list_timers).post(routes_timers::create_timer),
        )
        .route(
            "/timers/:id",
            patch(routes_timers::patch_timer)
                .delete(routes_timers::delete_timer)
                .post(routes_timers::post_timer_subresource),
        )
        .route("/system/health", get(routes_system::health))
        .route("/system/healthz", get(routes_system::healthz))
        .route("/system/info", get(routes_system::info))
        .route("/system/scan", get(routes_system::scan))
        .route("/system/refresh", post(routes_system::refresh))
        .route("/system/sessions", get(routes_system::list_sessions))
        .route("/sessions/:id", axum::routing::delete(routes_system::delete_session))
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            scope_middleware,
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    let media_routes = Router::new()
        .route(
            "/recordings/:id/playlist.m3u8",
            get(routes_media::get_playlist),
        )
        .route("/recordings/:id/stream.mp4", get(routes_media::get_mp4))
        .route("/recordings/:id/:segment", get(routes_media::get_segment))
        .route("/timeshift.m3u8", get(routes_media::get_timeshift))
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            auth::require_media_cookie,
        ));

    let v3 = auth_routes.merge(api_routes).merge(media_routes);

    Router::new()
        .nest("/api/v3", v3)
        .layer(middleware::from_fn(problem::request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Pick the required scope from method and path.
async fn scope_middleware(
    State(ctx): State<AppContext>,
    bearer: Option<
        axum_extra::typed_header::TypedHeader<
            axum_extra::headers::Authorization<axum_extra::headers::authorization::Bearer>,
        >,
    >,
    jar: axum_extra::extract::cookie::CookieJar,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    let is_admin_path = path.ends_with("/system/refresh") || path.contains("/sessions/");
    if is_admin_path {
        return auth::require_admin(State(ctx), bearer, jar, request, next).await;
    }
    match *request.method() {
        Method::GET | Method::HEAD => {
            auth::require_read(State(ctx), bearer, jar, request, next).await
        }
        _ => auth::require_write(State(ctx), bearer, jar, request, next).await,
    }
}

/// Start the HTTP server and run until a shutdown signal.
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let runner: Arc<dyn Runner> =
        Arc::new(crate::vod::runner::FfmpegRunner::new().context("ffmpeg is required")?);
    let prober: Arc<dyn Prober> = Arc::new(
        crate::probe::FfprobeProber::new(Duration::from_secs(config.probe.timeout_secs))
            .context("ffprobe is required")?,
    );

    let ctx = build_context(config, runner, prober, ProbeMode::SelfExec);
    spawn_background(&ctx);

    let app = create_router(ctx.clone());

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ctx.cancel.cancel();
    ctx.vod.cancel_all();
    ctx.probe_pool.shutdown();

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
