//! Configuration loading.
//!
//! The config file is TOML-shaped and opaque to the receiver; everything has
//! a serde default so an empty file (or none at all) yields a runnable
//! configuration.

mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from a path when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(p) => match Self::load(p) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to load config ({e:#}); using defaults");
                    Self::default()
                }
            },
            None => Self::default(),
        }
    }

    /// Basic semantic validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.probe.workers == 0 {
            anyhow::bail!("probe.workers must be at least 1");
        }
        if self.probe.queue_size == 0 {
            anyhow::bail!("probe.queue_size must be at least 1");
        }
        if self.intents.lease_secs == 0 {
            anyhow::bail!("intents.lease_secs must be non-zero");
        }
        for (name, profile) in &self.profiles.entries {
            if profile.container.is_empty() || profile.video_codec.is_empty() {
                anyhow::bail!("profile {name:?} is missing container or video codec");
            }
        }
        reqwest::Url::parse(&self.receiver.base_url)
            .with_context(|| format!("receiver.base_url invalid: {}", self.receiver.base_url))?;
        Ok(())
    }
}
