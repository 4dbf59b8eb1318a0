//! Session event bus.
//!
//! The intent handler publishes start/stop events here; a downstream worker
//! consumes them and drives tuner/stream lifecycles. Within one session,
//! publication is causally ordered by construction (the handler only emits a
//! stop for a session it has already started). Across sessions there is no
//! ordering guarantee.

use recast_common::{Error, Result, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Stop reasons carried on `session.stop`.
pub const STOP_REASON_CLIENT: &str = "client_stop";
pub const STOP_REASON_LEASE_EXPIRED: &str = "lease_expired";
pub const STOP_REASON_ADMIN: &str = "admin_stop";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// `session.start`
    SessionStart {
        session_id: SessionId,
        service_ref: String,
        profile: String,
        correlation_id: String,
        bucket: String,
    },
    /// `session.stop`
    SessionStop {
        session_id: SessionId,
        reason: String,
        correlation_id: String,
    },
}

impl SessionEvent {
    pub fn start(
        session_id: SessionId,
        service_ref: &str,
        profile: &str,
        correlation_id: &str,
        bucket: &str,
    ) -> Self {
        Self::SessionStart {
            session_id,
            service_ref: service_ref.to_string(),
            profile: profile.to_string(),
            correlation_id: correlation_id.to_string(),
            bucket: bucket.to_string(),
        }
    }

    pub fn stop(session_id: SessionId, reason: &str, correlation_id: &str) -> Self {
        Self::SessionStop {
            session_id,
            reason: reason.to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            Self::SessionStart { session_id, .. } | Self::SessionStop { session_id, .. } => {
                *session_id
            }
        }
    }
}

/// Publisher side of the bus. The intent handler must not claim acceptance
/// when a publish fails, so publishing is fallible.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: SessionEvent) -> Result<()>;
}

/// Broadcast-channel bus. Lagging or absent subscribers do not fail the
/// publisher; a closed channel does.
pub struct BroadcastBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: SessionEvent) -> Result<()> {
        match self.tx.send(event) {
            Ok(_) => Ok(()),
            // No subscriber yet is fine; the worker may attach later and the
            // event is observable via session state.
            Err(broadcast::error::SendError(event)) => {
                tracing::debug!(session_id = %event.session_id(), "no bus subscribers");
                Ok(())
            }
        }
    }
}

/// Bus that always fails; used to exercise the no-acceptance-on-publish-error
/// contract.
pub struct FailingBus;

impl EventBus for FailingBus {
    fn publish(&self, _event: SessionEvent) -> Result<()> {
        Err(Error::internal("bus unavailable"))
    }
}
