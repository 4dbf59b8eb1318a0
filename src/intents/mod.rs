//! Intent handling.
//!
//! Accepts `stream.start` / `stream.stop` intents, correlates them, enforces
//! the outbound source policy and admission, computes the server-side
//! idempotency key, persists the session, and publishes events for the
//! downstream worker. Acceptance is only claimed after a successful publish.

use recast_common::{CorrelationId, Error, Result, ServiceRef, SessionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionDecision, AdmissionRequest, Controller};
use crate::config::{IntentsConfig, ProfilesConfig};
use crate::session::bus::{EventBus, SessionEvent, STOP_REASON_CLIENT};
use crate::session::{PutOutcome, Session, StateStore};

/// Request body cap enforced by the HTTP layer.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const INTENT_START: &str = "stream.start";
pub const INTENT_STOP: &str = "stream.stop";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IntentRequest {
    #[serde(rename = "type")]
    pub intent_type: String,
    #[serde(default)]
    pub service_ref: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub start_ms: Option<u64>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub params: IntentParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IntentParams {
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub hwaccel: Option<String>,
    #[serde(default)]
    pub codecs: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Accepted,
    IdempotentReplay,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    pub session_id: SessionId,
    pub status: IntentStatus,
    pub correlation_id: String,
}

/// Preflight outcome classifier over the source check.
pub struct IntentHandler {
    store: StateStore,
    bus: Arc<dyn EventBus>,
    admission: Arc<Controller>,
    profiles: ProfilesConfig,
    cfg: IntentsConfig,
    http: reqwest::Client,
}

impl IntentHandler {
    pub fn new(
        store: StateStore,
        bus: Arc<dyn EventBus>,
        admission: Arc<Controller>,
        profiles: ProfilesConfig,
        cfg: IntentsConfig,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.preflight_timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self {
            store,
            bus,
            admission,
            profiles,
            cfg,
            http,
        }
    }

    pub async fn handle(&self, request: IntentRequest) -> Result<IntentResponse> {
        match request.intent_type.as_str() {
            INTENT_START => self.handle_start(request).await,
            INTENT_STOP => self.handle_stop(request),
            other => Err(Error::invalid_input(format!("unknown intent type: {other}"))),
        }
    }

    async fn handle_start(&self, request: IntentRequest) -> Result<IntentResponse> {
        let service_ref = request
            .service_ref
            .as_deref()
            .ok_or_else(|| Error::invalid_input("serviceRef is required for stream.start"))?;

        let correlation_id = CorrelationId::normalize(request.correlation_id.as_deref());

        // Source validation: direct URLs pass the outbound policy, everything
        // else must be a well-formed receiver reference.
        let is_url = service_ref.starts_with("http://") || service_ref.starts_with("https://");
        if is_url {
            check_outbound_url(service_ref, self.cfg.allow_private_destinations)?;
        } else {
            ServiceRef::parse(service_ref)?;
        }

        let profile = self.resolve_profile(&request.params)?;
        let bucket = bucket_for(request.start_ms);
        let idempotency_key = idempotency_key(INTENT_START, service_ref, &profile, &bucket);

        self.preflight(service_ref, is_url).await?;

        let wants_transcode = request.params.mode.as_deref() == Some("transcode");
        match self.admission.check(AdmissionRequest { wants_transcode }) {
            AdmissionDecision::Allow => {}
            AdmissionDecision::Reject {
                code,
                retry_after_secs,
            } => {
                return Err(Error::AdmissionRejected {
                    signal: code.as_str().to_string(),
                    retry_after_secs,
                });
            }
        }

        let lease = Duration::from_secs(self.cfg.lease_secs);
        let session = Session::new(
            service_ref.to_string(),
            profile.clone(),
            correlation_id.clone(),
            bucket.clone(),
            lease,
            self.cfg.heartbeat_interval_secs,
        );
        let session_id = session.session_id;

        match self
            .store
            .put_session_with_idempotency(session, &idempotency_key, lease)
        {
            PutOutcome::Replayed(original) => {
                let original_session = self.store.get(&original).ok_or_else(|| {
                    Error::internal("idempotency claim pointed at a vanished session")
                })?;
                debug!(session_id = %original, "intent replayed");
                Ok(IntentResponse {
                    session_id: original,
                    status: IntentStatus::IdempotentReplay,
                    correlation_id: original_session.correlation_id.to_string(),
                })
            }
            PutOutcome::Created => {
                let event = SessionEvent::start(
                    session_id,
                    service_ref,
                    &profile,
                    correlation_id.as_str(),
                    &bucket,
                );
                if let Err(e) = self.bus.publish(event) {
                    // No acceptance without a published event.
                    warn!(session_id = %session_id, error = %e, "publish failed; rolling back");
                    self.store.remove(&session_id);
                    return Err(Error::internal("event publish failed"));
                }
                info!(session_id = %session_id, correlation_id = %correlation_id, "session start accepted");
                Ok(IntentResponse {
                    session_id,
                    status: IntentStatus::Accepted,
                    correlation_id: correlation_id.to_string(),
                })
            }
        }
    }

    fn handle_stop(&self, request: IntentRequest) -> Result<IntentResponse> {
        let raw = request
            .session_id
            .as_deref()
            .ok_or_else(|| Error::invalid_input("sessionId is required for stream.stop"))?;
        let session_id = SessionId::parse(raw)
            .map_err(|_| Error::invalid_id(format!("malformed session ID: {raw}")))?;
        let session = self
            .store
            .get(&session_id)
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))?;

        let event = SessionEvent::stop(
            session_id,
            STOP_REASON_CLIENT,
            session.correlation_id.as_str(),
        );
        self.bus
            .publish(event)
            .map_err(|_| Error::internal("event publish failed"))?;

        info!(session_id = %session_id, "session stop accepted");
        Ok(IntentResponse {
            session_id,
            status: IntentStatus::Accepted,
            correlation_id: session.correlation_id.to_string(),
        })
    }

    /// Explicit profile > codec preference mapping > default.
    fn resolve_profile(&self, params: &IntentParams) -> Result<String> {
        if params.hwaccel.as_deref() == Some("force") && !self.profiles.gpu_verified {
            return Err(Error::HwaccelUnavailable(
                "hwaccel=force requires a verified GPU encoder".to_string(),
            ));
        }

        if let Some(explicit) = &params.profile {
            if !self.profiles.entries.contains_key(explicit) {
                return Err(Error::invalid_input(format!("unknown profile: {explicit}")));
            }
            return Ok(explicit.clone());
        }

        if let Some(codecs) = &params.codecs {
            if let Some(name) = self.profiles.for_codec_preference(codecs) {
                return Ok(name.to_string());
            }
        }

        Ok(self.cfg.default_profile.clone())
    }

    /// Bounded source check: HEAD with GET-on-405 fallback for URLs, a stat
    /// for file-backed references.
    async fn preflight(&self, service_ref: &str, is_url: bool) -> Result<()> {
        if !is_url {
            // Receiver-recorded asset: the path must at least exist.
            let sref = ServiceRef::parse(service_ref)?;
            if !std::path::Path::new(sref.path()).exists() {
                return Err(Error::not_found(format!(
                    "recording path missing: {}",
                    sref.path()
                )));
            }
            return Ok(());
        }

        let response = match self.http.head(service_ref).send().await {
            Ok(r) if r.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                self.http
                    .get(service_ref)
                    .header(reqwest::header::RANGE, "bytes=0-0")
                    .send()
                    .await
                    .map_err(classify_transport_error)?
            }
            Ok(r) => r,
            Err(e) => return Err(classify_transport_error(e)),
        };

        let status = response.status();
        match status.as_u16() {
            200..=399 => Ok(()),
            401 | 403 => Err(Error::Forbidden(format!("source rejected access: {status}"))),
            404 => Err(Error::not_found("source not found")),
            500..=599 => Err(Error::UpstreamResultFalse(format!(
                "source returned {status}"
            ))),
            other => Err(Error::upstream(format!("source returned {other}"))),
        }
    }
}

/// Compute the server-side idempotency key:
/// `sha256("v1:" + type + ":" + serviceRef + ":" + profile + ":" + bucket)`.
#[must_use]
pub fn idempotency_key(intent_type: &str, service_ref: &str, profile: &str, bucket: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("v1:{intent_type}:{service_ref}:{profile}:{bucket}"));
    hex::encode(hasher.finalize())
}

/// Coarse temporal bucket: `"0"` for live, `startMs/1000` when seeking.
#[must_use]
pub fn bucket_for(start_ms: Option<u64>) -> String {
    match start_ms {
        None | Some(0) => "0".to_string(),
        Some(ms) => (ms / 1000).to_string(),
    }
}

/// Outbound destination policy: private, loopback, and link-local targets
/// are denied unless explicitly permitted.
pub fn check_outbound_url(raw: &str, allow_private: bool) -> Result<()> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| Error::invalid_input(format!("invalid source URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::invalid_input(format!(
            "unsupported source scheme: {}",
            url.scheme()
        )));
    }
    if allow_private {
        return Ok(());
    }

    match url.host() {
        Some(url::Host::Ipv4(ip)) => deny_private_ip(IpAddr::V4(ip)),
        Some(url::Host::Ipv6(ip)) => deny_private_ip(IpAddr::V6(ip)),
        Some(url::Host::Domain(domain)) => {
            if domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
            {
                return Err(Error::Forbidden(format!(
                    "source host not permitted: {domain}"
                )));
            }
            Ok(())
        }
        None => Err(Error::invalid_input("source URL has no host")),
    }
}

fn deny_private_ip(ip: IpAddr) -> Result<()> {
    let denied = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || is_v6_private(&v6),
    };
    if denied {
        return Err(Error::Forbidden(format!("source address not permitted: {ip}")));
    }
    Ok(())
}

fn is_v6_private(v6: &std::net::Ipv6Addr) -> bool {
    let segments = v6.segments();
    // fc00::/7 unique-local, fe80::/10 link-local.
    (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
}

fn classify_transport_error(e: reqwest::Error) -> Error {
    let text = e.to_string().to_ascii_lowercase();
    if text.contains("connection refused") || text.contains("no route to host") {
        Error::upstream(format!("source unreachable: {e}"))
    } else if e.is_timeout() {
        Error::upstream(format!("source timed out: {e}"))
    } else {
        Error::upstream(format!("source check failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionMetrics, AdmissionState, AdmissionStateSource, RejectCode};
    use crate::session::bus::BroadcastBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OpenSource;

    impl AdmissionStateSource for OpenSource {
        fn snapshot(&self) -> AdmissionState {
            AdmissionState {
                tuner_slots_total: 2,
                session_cap: 16,
                transcode_budget_total: 2,
                ..Default::default()
            }
        }
    }

    struct NullMetrics;

    impl AdmissionMetrics for NullMetrics {
        fn admit(&self, _priority: &str) {}
        fn reject(&self, _code: RejectCode, _priority: &str) {}
    }

    pub struct CountingBus {
        pub published: AtomicUsize,
        inner: BroadcastBus,
    }

    impl CountingBus {
        fn new() -> Self {
            Self {
                published: AtomicUsize::new(0),
                inner: BroadcastBus::new(16),
            }
        }
    }

    impl EventBus for CountingBus {
        fn publish(&self, event: SessionEvent) -> recast_common::Result<()> {
            self.published.fetch_add(1, Ordering::SeqCst);
            self.inner.publish(event)
        }
    }

    fn handler_with_bus(bus: Arc<dyn EventBus>) -> IntentHandler {
        let admission = Arc::new(Controller::new(
            Some(Arc::new(OpenSource)),
            Arc::new(NullMetrics),
            5,
        ));
        IntentHandler::new(
            StateStore::new(),
            bus,
            admission,
            ProfilesConfig::default(),
            IntentsConfig::default(),
        )
    }

    fn start_request(service_ref: &str) -> IntentRequest {
        IntentRequest {
            intent_type: INTENT_START.into(),
            service_ref: Some(service_ref.into()),
            session_id: None,
            start_ms: None,
            correlation_id: None,
            params: IntentParams::default(),
        }
    }

    fn file_backed_ref() -> String {
        // A ref whose path actually exists so preflight passes.
        let dir = std::env::temp_dir().join("recast-intent-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("in.ts");
        std::fs::write(&file, "x").unwrap();
        format!("1:0:19:283D:3FB:1:C00000:0:0:0:{}", file.display())
    }

    #[test]
    fn test_idempotency_key_shape() {
        let key = idempotency_key(INTENT_START, "ref1", "universal", "0");
        assert_eq!(key.len(), 64);
        // Deterministic and input-sensitive.
        assert_eq!(key, idempotency_key(INTENT_START, "ref1", "universal", "0"));
        assert_ne!(key, idempotency_key(INTENT_START, "ref1", "universal", "1"));
        assert_ne!(key, idempotency_key(INTENT_STOP, "ref1", "universal", "0"));
    }

    #[test]
    fn test_bucket_mapping() {
        assert_eq!(bucket_for(None), "0");
        assert_eq!(bucket_for(Some(0)), "0");
        assert_eq!(bucket_for(Some(90_500)), "90");
        assert_eq!(bucket_for(Some(999)), "0");
    }

    #[test]
    fn test_outbound_policy_denies_private() {
        for url in [
            "http://127.0.0.1/stream",
            "http://10.1.2.3/stream",
            "http://192.168.1.10/stream",
            "http://172.16.0.1/stream",
            "http://169.254.0.1/stream",
            "http://localhost/stream",
            "http://[::1]/stream",
            "http://[fe80::1]/stream",
            "http://[fd00::1]/stream",
        ] {
            assert!(
                check_outbound_url(url, false).is_err(),
                "should deny {url}"
            );
            assert!(
                check_outbound_url(url, true).is_ok(),
                "should allow when permitted {url}"
            );
        }
        assert!(check_outbound_url("http://example.com/stream", false).is_ok());
        assert!(check_outbound_url("ftp://example.com/x", false).is_err());
        assert!(check_outbound_url("not a url", false).is_err());
    }

    #[tokio::test]
    async fn test_start_accepts_and_publishes() {
        let bus = Arc::new(CountingBus::new());
        let handler = handler_with_bus(Arc::clone(&bus) as Arc<dyn EventBus>);

        let response = handler.handle(start_request(&file_backed_ref())).await.unwrap();
        assert_eq!(response.status, IntentStatus::Accepted);
        assert!(!response.correlation_id.is_empty());
        assert_eq!(bus.published.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idempotent_replay_publishes_once() {
        let bus = Arc::new(CountingBus::new());
        let handler = handler_with_bus(Arc::clone(&bus) as Arc<dyn EventBus>);
        let sref = file_backed_ref();

        let first = handler.handle(start_request(&sref)).await.unwrap();
        let second = handler.handle(start_request(&sref)).await.unwrap();

        assert_eq!(second.status, IntentStatus::IdempotentReplay);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.correlation_id, first.correlation_id);
        assert_eq!(bus.published.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_rolls_back() {
        let handler = handler_with_bus(Arc::new(crate::session::bus::FailingBus));
        let err = handler.handle(start_request(&file_backed_ref())).await.unwrap_err();
        assert_eq!(err.code(), "internal_error");
        assert!(handler.store.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_session_is_not_found() {
        let bus = Arc::new(CountingBus::new());
        let handler = handler_with_bus(bus);
        let request = IntentRequest {
            intent_type: INTENT_STOP.into(),
            service_ref: None,
            session_id: Some(SessionId::new().to_string()),
            start_ms: None,
            correlation_id: None,
            params: IntentParams::default(),
        };
        let err = handler.handle(request).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_stop_publishes_client_stop() {
        let bus = Arc::new(CountingBus::new());
        let handler = handler_with_bus(Arc::clone(&bus) as Arc<dyn EventBus>);
        let started = handler.handle(start_request(&file_backed_ref())).await.unwrap();

        let request = IntentRequest {
            intent_type: INTENT_STOP.into(),
            service_ref: None,
            session_id: Some(started.session_id.to_string()),
            start_ms: None,
            correlation_id: None,
            params: IntentParams::default(),
        };
        let response = handler.handle(request).await.unwrap();
        assert_eq!(response.status, IntentStatus::Accepted);
        assert_eq!(response.correlation_id, started.correlation_id);
        assert_eq!(bus.published.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hwaccel_force_without_gpu_rejected() {
        let bus = Arc::new(CountingBus::new());
        let handler = handler_with_bus(bus);
        let mut request = start_request(&file_backed_ref());
        request.params.hwaccel = Some("force".into());
        let err = handler.handle(request).await.unwrap_err();
        assert_eq!(err.code(), "hwaccel_unavailable");
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn test_codec_preference_selects_profile() {
        let bus = Arc::new(CountingBus::new());
        let handler = handler_with_bus(bus);
        let mut request = start_request(&file_backed_ref());
        request.params.codecs = Some("av1,hevc,h264".into());
        let response = handler.handle(request).await.unwrap();
        let session = handler.store.get(&response.session_id).unwrap();
        assert_eq!(session.profile, "hevc-cpu");
    }

    #[tokio::test]
    async fn test_unknown_intent_type_rejected() {
        let bus = Arc::new(CountingBus::new());
        let handler = handler_with_bus(bus);
        let mut request = start_request(&file_backed_ref());
        request.intent_type = "stream.pause".into();
        let err = handler.handle(request).await.unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn test_missing_recording_path_rejected() {
        let bus = Arc::new(CountingBus::new());
        let handler = handler_with_bus(bus);
        let request = start_request("1:0:19:0:0:0:0:0:0:0:/nonexistent/path/in.ts");
        let err = handler.handle(request).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
