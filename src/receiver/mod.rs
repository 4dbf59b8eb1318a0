//! Receiver client.
//!
//! Typed wrapper over the set-top-box receiver's HTTP API. Transport
//! failures map to `upstream_unavailable`, logical failure payloads
//! (`result: false`) to `upstream_result_false`. Timer writes are verified
//! with a bounded read-back loop; a write the receiver will not reflect back
//! is reported as `receiver_inconsistent`.

pub mod timers;

use parking_lot::RwLock;
use recast_common::{Error, Result, TimerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ReceiverConfig;
use timers::Timer;

/// Read-back verification: attempts, spacing, and time tolerance.
const READBACK_ATTEMPTS: usize = 5;
const READBACK_SPACING: Duration = Duration::from_millis(100);
const READBACK_TOLERANCE_SECS: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingEntry {
    pub service_ref: String,
    pub name: String,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingListing {
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default)]
    pub directories: Vec<String>,
    #[serde(default)]
    pub recordings: Vec<RecordingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResultEnvelope {
    result: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TimersEnvelope {
    result: bool,
    #[serde(default)]
    timers: Vec<Timer>,
}

#[derive(Debug, Deserialize)]
struct RecordingsEnvelope {
    result: bool,
    #[serde(flatten)]
    listing: RecordingListing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverInfo {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub web_interface: String,
}

pub struct ReceiverClient {
    base_url: String,
    http: reqwest::Client,
}

impl ReceiverClient {
    pub fn new(cfg: &ReceiverConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(cfg.timeout_secs));
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            let mut headers = reqwest::header::HeaderMap::new();
            let credentials = base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                format!("{user}:{pass}"),
            );
            let value = format!("Basic {credentials}");
            headers.insert(
                reqwest::header::AUTHORIZATION,
                value
                    .parse()
                    .map_err(|_| Error::internal("invalid receiver credentials"))?,
            );
            builder = builder.default_headers(headers);
        }
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            http: builder
                .build()
                .map_err(|e| Error::internal(format!("receiver client build failed: {e}")))?,
        })
    }

    /// Browse recordings under a root.
    pub async fn recordings(&self, root: Option<&str>, path: Option<&str>) -> Result<RecordingListing> {
        let mut url = format!("{}/api/recordings", self.base_url);
        let mut sep = '?';
        if let Some(root) = root {
            url.push(sep);
            url.push_str(&format!("root={root}"));
            sep = '&';
        }
        if let Some(path) = path {
            url.push(sep);
            url.push_str(&format!("path={path}"));
        }
        let envelope: RecordingsEnvelope = self.get_json(&url).await?;
        if !envelope.result {
            return Err(Error::UpstreamResultFalse(
                "receiver rejected recording listing".to_string(),
            ));
        }
        Ok(envelope.listing)
    }

    pub async fn timers(&self) -> Result<Vec<Timer>> {
        let url = format!("{}/api/timers", self.base_url);
        let envelope: TimersEnvelope = self.get_json(&url).await?;
        if !envelope.result {
            return Err(Error::UpstreamResultFalse(
                "receiver rejected timer listing".to_string(),
            ));
        }
        Ok(envelope.timers)
    }

    /// Create a timer and verify it by reading the list back.
    pub async fn add_timer(&self, timer: &Timer) -> Result<Timer> {
        let url = format!("{}/api/timer", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(timer)
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: ResultEnvelope = decode(response).await?;
        if !envelope.result {
            return Err(Error::UpstreamResultFalse(envelope.message.unwrap_or_else(
                || "receiver rejected timer creation".to_string(),
            )));
        }
        self.verify_timer_present(timer).await
    }

    /// Update a timer in place; verified like a create.
    pub async fn change_timer(&self, id: TimerId, timer: &Timer) -> Result<Timer> {
        let url = format!("{}/api/timer/{id}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(timer)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("timer {id}")));
        }
        let envelope: ResultEnvelope = decode(response).await?;
        if !envelope.result {
            return Err(Error::UpstreamResultFalse(envelope.message.unwrap_or_else(
                || "receiver rejected timer change".to_string(),
            )));
        }
        self.verify_timer_present(timer).await
    }

    pub async fn delete_timer(&self, id: TimerId) -> Result<()> {
        let url = format!("{}/api/timer/{id}", self.base_url);
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("timer {id}")));
        }
        let envelope: ResultEnvelope = decode(response).await?;
        if !envelope.result {
            return Err(Error::UpstreamResultFalse(envelope.message.unwrap_or_else(
                || "receiver rejected timer deletion".to_string(),
            )));
        }
        Ok(())
    }

    pub async fn info(&self) -> Result<ReceiverInfo> {
        let url = format!("{}/api/about", self.base_url);
        self.get_json(&url).await
    }

    /// Bounded read-back: the receiver applies timer writes asynchronously
    /// and rounds timestamps, so we poll with a small time tolerance.
    async fn verify_timer_present(&self, written: &Timer) -> Result<Timer> {
        for attempt in 0..READBACK_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(READBACK_SPACING).await;
            }
            match self.timers().await {
                Ok(timers) => {
                    if let Some(found) = timers.into_iter().find(|t| {
                        t.service_ref == written.service_ref
                            && (t.begin - written.begin).abs() <= READBACK_TOLERANCE_SECS
                            && (t.end - written.end).abs() <= READBACK_TOLERANCE_SECS
                    }) {
                        debug!(attempt, "timer write verified");
                        return Ok(found);
                    }
                }
                Err(e) => warn!(attempt, error = %e, "read-back listing failed"),
            }
        }
        Err(Error::ReceiverInconsistent(
            "timer write did not appear in read-back".to_string(),
        ))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send().await.map_err(transport_error)?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_server_error() {
        return Err(Error::upstream(format!("receiver returned {status}")));
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::not_found("receiver resource"));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| Error::upstream(format!("receiver payload unparseable: {e}")))
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::upstream(format!("receiver unreachable: {e}"))
}

/// Process-wide receiver client, keyed by configuration epoch. An epoch bump
/// invalidates the cached client (and its connection pool); the next caller
/// rebuilds it.
pub struct ClientCache {
    cell: RwLock<Option<(u64, Arc<ReceiverClient>)>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self {
            cell: RwLock::new(None),
        }
    }

    pub fn get(&self, epoch: u64, cfg: &ReceiverConfig) -> Result<Arc<ReceiverClient>> {
        if let Some((cached_epoch, client)) = self.cell.read().as_ref() {
            if *cached_epoch == epoch {
                return Ok(Arc::clone(client));
            }
        }

        let mut cell = self.cell.write();
        // Another caller may have rebuilt while we waited for the lock.
        if let Some((cached_epoch, client)) = cell.as_ref() {
            if *cached_epoch == epoch {
                return Ok(Arc::clone(client));
            }
        }
        debug!(epoch, "rebuilding receiver client");
        let client = Arc::new(ReceiverClient::new(cfg)?);
        *cell = Some((epoch, Arc::clone(&client)));
        Ok(client)
    }
}

impl Default for ClientCache {
    fn default() -> Self {
        Self::new()
    }
}
