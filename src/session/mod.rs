//! Session state store.
//!
//! Sessions are lease-bounded in-memory records keyed by session ID, with an
//! idempotency-key table that lets an identical intent replay the original
//! session instead of creating a second one. A background task expires
//! leases.

pub mod bus;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use recast_common::{CorrelationId, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Session lifecycle, driven by the downstream worker via bus events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Starting,
    Active,
    Stopping,
    Ended,
}

/// Free-form per-session context propagated to the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub mode: String,
    pub profile: String,
    pub bucket: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub correlation_id: CorrelationId,
    /// Opaque source: a receiver service reference or a direct URL.
    pub service_ref: String,
    pub profile: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub heartbeat_interval_secs: u32,
    pub context: SessionContext,
}

impl Session {
    pub fn new(
        service_ref: String,
        profile: String,
        correlation_id: CorrelationId,
        bucket: String,
        lease: Duration,
        heartbeat_interval_secs: u32,
    ) -> Self {
        let now = Utc::now();
        let lease = ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(90));
        Self {
            session_id: SessionId::new(),
            context: SessionContext {
                mode: "live".to_string(),
                profile: profile.clone(),
                bucket,
                correlation_id: correlation_id.to_string(),
            },
            correlation_id,
            service_ref,
            profile,
            state: SessionState::New,
            created_at: now,
            updated_at: now,
            lease_expires_at: now + lease,
            heartbeat_interval_secs,
        }
    }
}

/// Outcome of an idempotency-aware insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The session was stored; the caller owns follow-up work (publish).
    Created,
    /// The key was already claimed; here is the original session.
    Replayed(SessionId),
}

#[derive(Debug, Clone)]
struct IdempotencyEntry {
    session_id: SessionId,
    lease_expires_at: DateTime<Utc>,
}

/// Thread-safe store owning all sessions.
#[derive(Clone)]
pub struct StateStore {
    sessions: Arc<DashMap<SessionId, Session>>,
    idempotency: Arc<DashMap<String, IdempotencyEntry>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            idempotency: Arc::new(DashMap::new()),
        }
    }

    /// Atomically store a session under an idempotency key.
    ///
    /// When the key already holds a live session, nothing is inserted and
    /// the original session ID is returned instead.
    pub fn put_session_with_idempotency(
        &self,
        session: Session,
        idempotency_key: &str,
        lease: Duration,
    ) -> PutOutcome {
        let lease =
            ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(90));
        let now = Utc::now();

        // The entry API keeps check-and-claim atomic per key.
        let entry = self
            .idempotency
            .entry(idempotency_key.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let existing = occupied.get().clone();
                if existing.lease_expires_at > now
                    && self.sessions.contains_key(&existing.session_id)
                {
                    return PutOutcome::Replayed(existing.session_id);
                }
                // Stale claim: take it over.
                occupied.insert(IdempotencyEntry {
                    session_id: session.session_id,
                    lease_expires_at: now + lease,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(IdempotencyEntry {
                    session_id: session.session_id,
                    lease_expires_at: now + lease,
                });
            }
        }

        self.sessions.insert(session.session_id, session);
        PutOutcome::Created
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Apply a state transition from the worker.
    pub fn set_state(&self, id: &SessionId, state: SessionState) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.state = state;
                session.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Extend a session's lease (heartbeat).
    pub fn touch(&self, id: &SessionId, lease: Duration) -> bool {
        let lease =
            ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(90));
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                let now = Utc::now();
                session.updated_at = now;
                session.lease_expires_at = now + lease;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Drop sessions whose lease expired, plus stale idempotency claims.
    pub fn expire_leases(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.sessions.retain(|id, session| {
            if session.lease_expires_at <= now {
                tracing::info!(session_id = %id, "session lease expired");
                removed += 1;
                false
            } else {
                true
            }
        });
        self.idempotency
            .retain(|_, entry| entry.lease_expires_at > now);
        removed
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic lease expiry task.
pub fn start_expiry_task(store: StateStore, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            store.expire_leases();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "1:0:19:283D:3FB:1:C00000:0:0:0:/media/hdd/a.ts".to_string(),
            "universal".into(),
            CorrelationId::generate(),
            "0".into(),
            Duration::from_secs(90),
            30,
        )
    }

    #[test]
    fn test_put_and_get() {
        let store = StateStore::new();
        let s = session();
        let id = s.session_id;
        assert_eq!(
            store.put_session_with_idempotency(s, "key1", Duration::from_secs(90)),
            PutOutcome::Created
        );
        let stored = store.get(&id).unwrap();
        assert_eq!(stored.state, SessionState::New);
        assert_eq!(stored.profile, "universal");
    }

    #[test]
    fn test_idempotent_replay_returns_original() {
        let store = StateStore::new();
        let first = session();
        let first_id = first.session_id;
        store.put_session_with_idempotency(first, "key1", Duration::from_secs(90));

        let second = session();
        let outcome =
            store.put_session_with_idempotency(second.clone(), "key1", Duration::from_secs(90));
        assert_eq!(outcome, PutOutcome::Replayed(first_id));
        // The second session was not stored.
        assert!(store.get(&second.session_id).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_different_keys_do_not_collide() {
        let store = StateStore::new();
        store.put_session_with_idempotency(session(), "key1", Duration::from_secs(90));
        let outcome =
            store.put_session_with_idempotency(session(), "key2", Duration::from_secs(90));
        assert_eq!(outcome, PutOutcome::Created);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_stale_claim_taken_over() {
        let store = StateStore::new();
        let first = session();
        let first_id = first.session_id;
        store.put_session_with_idempotency(first, "key1", Duration::from_secs(90));
        // Remove the session behind the claim; the claim is now stale.
        store.remove(&first_id);

        let second = session();
        let outcome =
            store.put_session_with_idempotency(second, "key1", Duration::from_secs(90));
        assert_eq!(outcome, PutOutcome::Created);
    }

    #[test]
    fn test_state_transitions() {
        let store = StateStore::new();
        let s = session();
        let id = s.session_id;
        store.put_session_with_idempotency(s, "key1", Duration::from_secs(90));

        assert!(store.set_state(&id, SessionState::Active));
        assert_eq!(store.get(&id).unwrap().state, SessionState::Active);
        assert!(!store.set_state(&SessionId::new(), SessionState::Active));
    }

    #[test]
    fn test_touch_extends_lease() {
        let store = StateStore::new();
        let s = session();
        let id = s.session_id;
        store.put_session_with_idempotency(s, "key1", Duration::from_secs(1));
        let before = store.get(&id).unwrap().lease_expires_at;
        assert!(store.touch(&id, Duration::from_secs(300)));
        assert!(store.get(&id).unwrap().lease_expires_at > before);
    }

    #[test]
    fn test_expire_leases() {
        let store = StateStore::new();
        let mut s = session();
        s.lease_expires_at = Utc::now() - ChronoDuration::seconds(1);
        let id = s.session_id;
        store.put_session_with_idempotency(s, "key1", Duration::from_secs(90));

        assert_eq!(store.expire_leases(), 1);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_expired_lease_allows_new_claim() {
        let store = StateStore::new();
        let mut s = session();
        s.lease_expires_at = Utc::now() - ChronoDuration::seconds(1);
        store.put_session_with_idempotency(s, "key1", Duration::from_secs(90));
        store.expire_leases();

        let outcome =
            store.put_session_with_idempotency(session(), "key1", Duration::from_secs(90));
        assert_eq!(outcome, PutOutcome::Created);
    }
}
