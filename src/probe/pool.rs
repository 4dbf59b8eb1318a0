//! Bounded probe pool with in-flight deduplication.
//!
//! The pool serializes "should we probe" decisions through the registry
//! lock: concurrent triggers for the same ID collapse into a single probe
//! execution, and a full queue reverts the entry to its previous state
//! rather than leaving it stuck in PREPARING.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Prober, StreamInfo};
use crate::truth::ProbeState;

/// Result of a trigger attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A probe for this ID is already running or queued.
    AlreadyInFlight,
    /// The probe was enqueued.
    Enqueued,
    /// The queue is full; the entry state was reverted.
    QueueFull,
    /// The pool is shutting down.
    Closed,
}

/// Latest known probe state per recording ID.
#[derive(Debug, Clone, Default)]
pub struct ProbeRecord {
    pub state: ProbeState,
    pub info: Option<StreamInfo>,
    pub error: Option<String>,
    pub updated_at: Option<SystemTime>,
}

#[derive(Default)]
pub struct ProbeRegistry {
    states: RwLock<HashMap<String, ProbeRecord>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> ProbeRecord {
        self.states.read().get(id).cloned().unwrap_or_default()
    }

    fn record_success(&self, id: &str, info: StreamInfo) {
        let mut states = self.states.write();
        states.insert(
            id.to_string(),
            ProbeRecord {
                state: ProbeState::Ready,
                info: Some(info),
                error: None,
                updated_at: Some(SystemTime::now()),
            },
        );
    }

    fn record_failure(&self, id: &str, error: String) {
        let mut states = self.states.write();
        let prev = states.get(id).cloned().unwrap_or_default();
        states.insert(
            id.to_string(),
            ProbeRecord {
                state: ProbeState::Failed,
                info: prev.info,
                error: Some(error),
                updated_at: Some(SystemTime::now()),
            },
        );
    }

    /// Drop an entry entirely (used by cache eviction).
    pub fn forget(&self, id: &str) {
        self.states.write().remove(id);
    }
}

struct Job {
    id: String,
    path: PathBuf,
}

pub struct ProbePool {
    tx: mpsc::Sender<Job>,
    registry: Arc<ProbeRegistry>,
    cancel: CancellationToken,
}

impl ProbePool {
    pub fn new(
        prober: Arc<dyn Prober>,
        registry: Arc<ProbeRegistry>,
        workers: usize,
        queue_size: usize,
        probe_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_size.max(1));
        tokio::spawn(Self::pump(
            rx,
            prober,
            Arc::clone(&registry),
            workers.max(1),
            probe_timeout,
            cancel.clone(),
        ));
        Self {
            tx,
            registry,
            cancel,
        }
    }

    /// Attempt to schedule a probe for `id`.
    ///
    /// Exactly one probe runs per ID regardless of how many callers trigger
    /// concurrently; the losers observe `AlreadyInFlight`.
    pub fn trigger(&self, id: &str, path: PathBuf) -> TriggerOutcome {
        // The registry lock is held across the enqueue attempt so that state
        // transitions and queue occupancy stay consistent.
        let mut states = self.registry.states.write();
        let prev = states.get(id).cloned().unwrap_or_default();
        if prev.state == ProbeState::Preparing {
            return TriggerOutcome::AlreadyInFlight;
        }

        states.insert(
            id.to_string(),
            ProbeRecord {
                state: ProbeState::Preparing,
                info: prev.info.clone(),
                error: None,
                updated_at: Some(SystemTime::now()),
            },
        );

        match self.tx.try_send(Job {
            id: id.to_string(),
            path,
        }) {
            Ok(()) => {
                debug!(id, "probe enqueued");
                TriggerOutcome::Enqueued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                states.insert(id.to_string(), prev);
                warn!(id, "probe queue full; state reverted");
                TriggerOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                states.insert(id.to_string(), prev);
                TriggerOutcome::Closed
            }
        }
    }

    pub fn registry(&self) -> &Arc<ProbeRegistry> {
        &self.registry
    }

    /// Stop accepting work and cancel running probes.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn pump(
        mut rx: mpsc::Receiver<Job>,
        prober: Arc<dyn Prober>,
        registry: Arc<ProbeRegistry>,
        workers: usize,
        probe_timeout: Duration,
        cancel: CancellationToken,
    ) {
        let sem = Arc::new(Semaphore::new(workers));
        loop {
            // Take a worker slot before touching the queue, so a full queue
            // keeps rejecting new work while all workers are busy.
            let permit = tokio::select! {
                permit = Arc::clone(&sem).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };

            let job = tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            let prober = Arc::clone(&prober);
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = tokio::select! {
                    r = tokio::time::timeout(probe_timeout, prober.probe(&job.path)) => r,
                    _ = cancel.cancelled() => {
                        registry.record_failure(&job.id, "probe cancelled".to_string());
                        return;
                    }
                };
                match result {
                    Ok(Ok(info)) => {
                        debug!(id = %job.id, "probe completed");
                        registry.record_success(&job.id, info);
                    }
                    Ok(Err(e)) => {
                        warn!(id = %job.id, error = %e, "probe failed");
                        registry.record_failure(&job.id, e.to_string());
                    }
                    Err(_) => {
                        warn!(id = %job.id, "probe timed out");
                        registry.record_failure(&job.id, "probe timed out".to_string());
                    }
                }
            });
        }
    }
}
