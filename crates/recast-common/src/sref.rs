//! Service references and the recording-ID codec.
//!
//! A service reference is the receiver's opaque identifier for a live service
//! or recorded asset: a colon-separated tuple followed by an absolute path,
//! e.g. `1:0:19:283D:3FB:1:C00000:0:0:0:/media/hdd/movie/show.ts`. Clients
//! never see raw references; they see recording IDs, which are URL-safe
//! unpadded base64 of the reference. The codec is a bijection over valid
//! references: `decode(encode(r)) == r`, and every ID that survives decoding
//! re-validates.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Minimum accepted recording-ID length.
pub const RECORDING_ID_MIN_LEN: usize = 16;
/// Maximum accepted recording-ID length.
pub const RECORDING_ID_MAX_LEN: usize = 1024;

const SERVICE_REF_MAX_LEN: usize = 768;

/// A validated receiver service reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceRef(String);

impl ServiceRef {
    /// Validate and wrap a raw receiver reference.
    ///
    /// Rejects control characters, traversal segments, references without a
    /// colon-separated tuple, and references whose tail is not an absolute
    /// path.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.len() > SERVICE_REF_MAX_LEN {
            return Err(Error::invalid_id("service reference length out of range"));
        }
        if raw.chars().any(char::is_control) {
            return Err(Error::invalid_id(
                "service reference contains control characters",
            ));
        }

        // Tuple and path split at the first ":/" boundary. Paths may contain
        // further colons; the tuple may not contain slashes.
        let split = raw
            .find(":/")
            .ok_or_else(|| Error::invalid_id("service reference missing absolute path"))?;
        let (tuple, path) = (&raw[..split], &raw[split + 1..]);

        if tuple.is_empty() || !tuple.contains(':') {
            return Err(Error::invalid_id("service reference tuple too short"));
        }
        for field in tuple.split(':') {
            if !field.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(Error::invalid_id("service reference tuple malformed"));
            }
        }

        debug_assert!(path.starts_with('/'));
        if path.split('/').any(|seg| seg == "..") {
            return Err(Error::invalid_id("service reference path traversal"));
        }

        Ok(Self(raw.to_string()))
    }

    /// The raw reference string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The absolute on-disk path portion of the reference.
    #[must_use]
    pub fn path(&self) -> &str {
        // Safe by construction: parse() guarantees a ":/" boundary.
        let split = self.0.find(":/").unwrap_or(0);
        &self.0[split + 1..]
    }

    /// Lower-case hex SHA-256 of the reference, used as the cache directory
    /// name so arbitrary reference bytes never reach the filesystem.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl TryFrom<String> for ServiceRef {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ServiceRef> for String {
    fn from(sref: ServiceRef) -> Self {
        sref.0
    }
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque client-facing identifier for a recorded asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingId(String);

impl RecordingId {
    /// Encode a service reference into its client-facing ID.
    #[must_use]
    pub fn encode(sref: &ServiceRef) -> Self {
        Self(URL_SAFE_NO_PAD.encode(sref.as_str().as_bytes()))
    }

    /// Decode and re-validate a client-supplied recording ID.
    ///
    /// Invalid IDs never yield a partial value.
    pub fn decode(raw: &str) -> Result<ServiceRef> {
        if raw.len() < RECORDING_ID_MIN_LEN || raw.len() > RECORDING_ID_MAX_LEN {
            return Err(Error::invalid_id("recording ID length out of range"));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.as_bytes())
            .map_err(|_| Error::invalid_id("recording ID is not URL-safe base64"))?;
        let decoded = String::from_utf8(bytes)
            .map_err(|_| Error::invalid_id("recording ID decodes to non-UTF-8"))?;
        ServiceRef::parse(&decoded)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
