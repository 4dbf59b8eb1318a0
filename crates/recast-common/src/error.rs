//! Common error taxonomy used throughout recast.
//!
//! Every variant carries a stable, language-neutral code that appears in
//! RFC-7807 problem responses, plus an HTTP status mapping. Collaborators
//! return these typed values; the HTTP boundary turns them into problems.

/// Common error type for recast.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request is syntactically or semantically invalid.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A recording, timer, or session ID failed validation.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// The requested asset, session, or timer does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Scope or policy denies access.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The idempotent target already exists.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Scheduling overlap or receiver-reported conflict.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Logically invalid request (e.g. begin >= end).
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// The asset is still being built; retryable.
    #[error("Preparing: {detail}")]
    Preparing { detail: String, retry_after_secs: u32 },

    /// The receiver is unreachable.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The receiver returned a logical failure payload.
    #[error("Upstream reported failure: {0}")]
    UpstreamResultFalse(String),

    /// Capacity exhausted; may carry a retry hint.
    #[error("Admission rejected: {signal}")]
    AdmissionRejected {
        signal: String,
        retry_after_secs: Option<u32>,
    },

    /// Hardware acceleration was required but is not available.
    #[error("Hardware acceleration unavailable: {0}")]
    HwaccelUnavailable(String),

    /// No tuner slots are configured or free.
    #[error("No tuner slots available")]
    NoTunerSlots,

    /// Write-then-read-back verification against the receiver failed.
    #[error("Receiver state inconsistent: {0}")]
    ReceiverInconsistent(String),

    /// Unclassified failure. Logged with full context, never leaked.
    #[error("Internal error: {0}")]
    Internal(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new InvalidInput error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new InvalidId error.
    pub fn invalid_id<S: Into<String>>(msg: S) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Create a new NotFound error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new Unprocessable error.
    pub fn unprocessable<S: Into<String>>(msg: S) -> Self {
        Self::Unprocessable(msg.into())
    }

    /// Create a new Preparing error with a retry hint.
    pub fn preparing<S: Into<String>>(detail: S, retry_after_secs: u32) -> Self {
        Self::Preparing {
            detail: detail.into(),
            retry_after_secs,
        }
    }

    /// Create a new UpstreamUnavailable error.
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    /// Create a new Internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable wire code for problem responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidId(_) => "invalid_id",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Duplicate(_) => "duplicate",
            Self::Conflict(_) => "conflict",
            Self::Unprocessable(_) => "unprocessable",
            Self::Preparing { .. } => "preparing",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamResultFalse(_) => "upstream_result_false",
            Self::AdmissionRejected { .. } => "admission_rejected",
            Self::HwaccelUnavailable(_) => "hwaccel_unavailable",
            Self::NoTunerSlots => "no_tuner_slots",
            Self::ReceiverInconsistent(_) => "receiver_inconsistent",
            Self::Internal(_) | Self::Io(_) => "internal_error",
        }
    }

    /// HTTP status this error maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::InvalidId(_) | Self::HwaccelUnavailable(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Duplicate(_) | Self::Conflict(_) => 409,
            Self::Unprocessable(_) => 422,
            Self::Preparing { .. } | Self::AdmissionRejected { .. } | Self::NoTunerSlots => 503,
            Self::UpstreamUnavailable(_)
            | Self::UpstreamResultFalse(_)
            | Self::ReceiverInconsistent(_) => 502,
            Self::Internal(_) | Self::Io(_) => 500,
        }
    }

    /// Retry hint in seconds, when the failure is transient.
    pub fn retry_after_secs(&self) -> Option<u32> {
        match self {
            Self::Preparing {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            Self::AdmissionRejected {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;
