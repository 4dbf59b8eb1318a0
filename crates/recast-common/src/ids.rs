//! Typed ID wrappers for type safety across recast.
//!
//! Newtype wrappers around UUIDs (and one validated string) prevent mixing
//! different kinds of identifiers, e.g. passing a SessionId where a TimerId
//! is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a session ID from its string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<SessionId> for Uuid {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an HTTP request, propagated as `X-Request-Id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiver-assigned timer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(u64);

impl TimerId {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation ID stitching one user action across asynchronous boundaries.
///
/// Client-supplied values are normalized; anything outside the allowed
/// alphabet or length is replaced with a generated ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    const MAX_LEN: usize = 64;

    /// Generate a new random correlation ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Normalize a client-supplied correlation ID, generating a fresh one
    /// when the input is absent or unusable.
    #[must_use]
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(s) if !s.is_empty() && s.len() <= Self::MAX_LEN && Self::alphabet_ok(s) => {
                Self(s.to_string())
            }
            _ => Self::generate(),
        }
    }

    fn alphabet_ok(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_uniqueness() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new();
        let parsed = SessionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_session_id_serde_transparent() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn test_timer_id_raw() {
        let id = TimerId::new(42);
        assert_eq!(id.raw(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_correlation_normalize_keeps_valid() {
        let c = CorrelationId::normalize(Some("play-42_x.y"));
        assert_eq!(c.as_str(), "play-42_x.y");
    }

    #[test]
    fn test_correlation_normalize_trims() {
        let c = CorrelationId::normalize(Some("  abc  "));
        assert_eq!(c.as_str(), "abc");
    }

    #[test]
    fn test_correlation_normalize_rejects_bad_alphabet() {
        let c = CorrelationId::normalize(Some("has spaces"));
        assert_ne!(c.as_str(), "has spaces");
        assert!(!c.as_str().is_empty());
    }

    #[test]
    fn test_correlation_normalize_rejects_too_long() {
        let long = "x".repeat(65);
        let c = CorrelationId::normalize(Some(&long));
        assert_ne!(c.as_str(), long);
    }

    #[test]
    fn test_correlation_generate_when_absent() {
        let c = CorrelationId::normalize(None);
        assert!(!c.as_str().is_empty());
    }
}
