//! Storage health monitoring.
//!
//! Periodically determines mount status from the OS mount table and probes
//! readability/writability of each configured path. The probe runs in a
//! short-lived child process so that syscalls hung on stale network mounts
//! cannot leak into the primary process. Results are cached; API requests
//! only ever read the cache.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a caller may wait for a probe slot before the sample is skipped.
const SLOT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountStatus {
    Mounted,
    Unmounted,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Timeout,
    Error,
    Skipped,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Rw,
    Ro,
    None,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSample {
    pub path: PathBuf,
    pub mount: MountStatus,
    pub health: HealthStatus,
    pub access: AccessLevel,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

/// How the monitor executes the access probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Re-exec this binary with the hidden `storage-probe` subcommand.
    /// Hung filesystem syscalls stay in the child.
    SelfExec,
    /// Run in-process on the blocking pool. Used by tests.
    InProcess,
}

#[derive(Clone)]
pub struct StorageMonitor {
    paths: Vec<PathBuf>,
    probe_timeout: Duration,
    mode: ProbeMode,
    slots: Arc<Semaphore>,
    results: Arc<RwLock<HashMap<PathBuf, StorageSample>>>,
}

impl StorageMonitor {
    pub fn new(
        paths: Vec<PathBuf>,
        probe_timeout: Duration,
        max_concurrent: usize,
        mode: ProbeMode,
    ) -> Self {
        Self {
            paths,
            probe_timeout,
            mode,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            results: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Latest cached sample per path. Never blocks on I/O.
    pub fn latest(&self) -> Vec<StorageSample> {
        let mut samples: Vec<StorageSample> = self.results.read().values().cloned().collect();
        samples.sort_by(|a, b| a.path.cmp(&b.path));
        samples
    }

    /// Run the monitor until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            self.sample_all().await;
        }
    }

    /// One full sampling pass across the configured paths.
    pub async fn sample_all(&self) {
        let mount_table = read_mount_table();
        for path in self.paths.clone() {
            let mount = mount_status(&path, mount_table.as_deref());
            let sample = self.sample_one(path.clone(), mount).await;
            debug!(
                path = %path.display(),
                mount = ?sample.mount,
                health = ?sample.health,
                "storage sample"
            );
            self.results.write().insert(path, sample);
        }
    }

    async fn sample_one(&self, path: PathBuf, mount: MountStatus) -> StorageSample {
        let now = chrono::Utc::now;

        let permit =
            match tokio::time::timeout(SLOT_ACQUIRE_TIMEOUT, Arc::clone(&self.slots).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                _ => {
                    return StorageSample {
                        path,
                        mount,
                        health: HealthStatus::Skipped,
                        access: AccessLevel::None,
                        checked_at: now(),
                    };
                }
            };

        let (health, access) = {
            let _permit = permit;
            match self.mode {
                ProbeMode::SelfExec => self.probe_via_child(&path).await,
                ProbeMode::InProcess => self.probe_in_process(&path).await,
            }
        };

        StorageSample {
            path,
            mount,
            health,
            access,
            checked_at: now(),
        }
    }

    async fn probe_via_child(&self, path: &Path) -> (HealthStatus, AccessLevel) {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                warn!(error = %e, "cannot resolve own binary for storage probe");
                return (HealthStatus::Error, AccessLevel::None);
            }
        };
        let result = tokio::time::timeout(
            self.probe_timeout,
            tokio::process::Command::new(exe)
                .arg("storage-probe")
                .arg(path)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Err(_) => (HealthStatus::Timeout, AccessLevel::None),
            Ok(Err(e)) => {
                warn!(error = %e, "storage probe failed to spawn");
                (HealthStatus::Error, AccessLevel::None)
            }
            Ok(Ok(output)) if output.status.success() => {
                let verdict = String::from_utf8_lossy(&output.stdout);
                match verdict.trim() {
                    "rw" => (HealthStatus::Ok, AccessLevel::Rw),
                    "ro" => (HealthStatus::Ok, AccessLevel::Ro),
                    "none" => (HealthStatus::Ok, AccessLevel::None),
                    other => {
                        warn!(other, "storage probe printed an unknown verdict");
                        (HealthStatus::Error, AccessLevel::None)
                    }
                }
            }
            Ok(Ok(_)) => (HealthStatus::Error, AccessLevel::None),
        }
    }

    async fn probe_in_process(&self, path: &Path) -> (HealthStatus, AccessLevel) {
        let path = path.to_path_buf();
        let result = tokio::time::timeout(
            self.probe_timeout,
            tokio::task::spawn_blocking(move || probe_access(&path)),
        )
        .await;
        match result {
            Err(_) => (HealthStatus::Timeout, AccessLevel::None),
            Ok(Err(_)) => (HealthStatus::Error, AccessLevel::None),
            Ok(Ok(access)) => (HealthStatus::Ok, access),
        }
    }
}

/// Child-process side of the probe: classify a path as rw / ro / none.
///
/// Read access is a directory listing; write access is creating and removing
/// a scratch file.
#[must_use]
pub fn probe_access(path: &Path) -> AccessLevel {
    if std::fs::read_dir(path).is_err() {
        return AccessLevel::None;
    }
    let scratch = path.join(format!(".recast-probe-{}", std::process::id()));
    match std::fs::write(&scratch, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&scratch);
            AccessLevel::Rw
        }
        Err(_) => AccessLevel::Ro,
    }
}

impl AccessLevel {
    /// Wire form printed by the probe subcommand.
    #[must_use]
    pub fn verdict(&self) -> &'static str {
        match self {
            Self::Rw => "rw",
            Self::Ro => "ro",
            Self::None => "none",
        }
    }
}

#[cfg(target_os = "linux")]
fn read_mount_table() -> Option<String> {
    std::fs::read_to_string("/proc/mounts").ok()
}

#[cfg(not(target_os = "linux"))]
fn read_mount_table() -> Option<String> {
    None
}

/// Determine mount status from the mount table.
///
/// A path counts as mounted when its longest covering mount point is deeper
/// than `/` (or matches exactly); a storage path covered only by the root
/// filesystem means its dedicated mount is absent.
fn mount_status(path: &Path, table: Option<&str>) -> MountStatus {
    let Some(table) = table else {
        return MountStatus::Unknown;
    };

    let mut best: Option<&str> = None;
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        if path.starts_with(mount_point)
            && best.map(|b| mount_point.len() > b.len()).unwrap_or(true)
        {
            best = Some(mount_point);
        }
    }

    match best {
        Some("/") => MountStatus::Unmounted,
        Some(_) => MountStatus::Mounted,
        None => MountStatus::Unknown,
    }
}
