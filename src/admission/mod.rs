//! Admission control.
//!
//! A stateless capacity gate over an injected state snapshot: tuner slots,
//! active sessions, and the transcode budget. Counters live elsewhere (the
//! worker updates them); the controller only reads and classifies.

use serde::Serialize;
use std::sync::Arc;

/// Read-only capacity snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionState {
    pub tuner_slots_total: u32,
    pub tuner_slots_in_use: u32,
    pub active_sessions: u32,
    pub session_cap: u32,
    pub transcode_budget_total: u32,
    pub transcode_in_use: u32,
}

/// Source of the capacity snapshot, updated by the worker.
pub trait AdmissionStateSource: Send + Sync {
    fn snapshot(&self) -> AdmissionState;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub wants_transcode: bool,
}

/// Rejection signals, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    NoTuners,
    SessionsFull,
    TranscodeBudgetExceeded,
    Unavailable,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoTuners => "no_tuners",
            Self::SessionsFull => "sessions_full",
            Self::TranscodeBudgetExceeded => "transcode_budget_exceeded",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allow,
    Reject {
        code: RejectCode,
        retry_after_secs: Option<u32>,
    },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Admission metrics sink. The production recorder logs structured counter
/// events; tests swap in an accumulator.
pub trait AdmissionMetrics: Send + Sync {
    fn admit(&self, priority: &str);
    fn reject(&self, code: RejectCode, priority: &str);
}

/// tracing-backed recorder.
pub struct LogMetrics;

impl AdmissionMetrics for LogMetrics {
    fn admit(&self, priority: &str) {
        tracing::info!(counter = "admission_admit", priority, "admitted");
    }

    fn reject(&self, code: RejectCode, priority: &str) {
        tracing::info!(
            counter = "admission_reject",
            code = code.as_str(),
            priority,
            "rejected"
        );
    }
}

pub struct Controller {
    /// Absent when admission is not wired; every check then returns
    /// `unavailable` without a retry hint.
    state_source: Option<Arc<dyn AdmissionStateSource>>,
    metrics: Arc<dyn AdmissionMetrics>,
    retry_after_secs: u32,
}

impl Controller {
    pub fn new(
        state_source: Option<Arc<dyn AdmissionStateSource>>,
        metrics: Arc<dyn AdmissionMetrics>,
        retry_after_secs: u32,
    ) -> Self {
        Self {
            state_source,
            metrics,
            retry_after_secs,
        }
    }

    /// Evaluate a request against the current snapshot.
    pub fn check(&self, request: AdmissionRequest) -> AdmissionDecision {
        let Some(source) = &self.state_source else {
            self.metrics.reject(RejectCode::Unavailable, "normal");
            return AdmissionDecision::Reject {
                code: RejectCode::Unavailable,
                retry_after_secs: None,
            };
        };
        let state = source.snapshot();

        if state.tuner_slots_total == 0 || state.tuner_slots_in_use >= state.tuner_slots_total {
            return self.reject(RejectCode::NoTuners);
        }
        if state.active_sessions >= state.session_cap {
            return self.reject(RejectCode::SessionsFull);
        }
        if request.wants_transcode && state.transcode_in_use >= state.transcode_budget_total {
            return self.reject(RejectCode::TranscodeBudgetExceeded);
        }

        self.metrics.admit("normal");
        AdmissionDecision::Allow
    }

    fn reject(&self, code: RejectCode) -> AdmissionDecision {
        self.metrics.reject(code, "normal");
        AdmissionDecision::Reject {
            code,
            retry_after_secs: Some(self.retry_after_secs),
        }
    }
}

/// Snapshot source backed by configuration caps and the live session store.
pub struct ConfiguredStateSource {
    pub tuner_slots_total: u32,
    pub session_cap: u32,
    pub transcode_budget_total: u32,
    pub store: crate::session::StateStore,
}

impl AdmissionStateSource for ConfiguredStateSource {
    fn snapshot(&self) -> AdmissionState {
        let active = self.store.len() as u32;
        AdmissionState {
            tuner_slots_total: self.tuner_slots_total,
            // Each active session is assumed to pin a tuner until the worker
            // reports otherwise.
            tuner_slots_in_use: active.min(self.tuner_slots_total),
            active_sessions: active,
            session_cap: self.session_cap,
            transcode_budget_total: self.transcode_budget_total,
            transcode_in_use: 0,
        }
    }
}
