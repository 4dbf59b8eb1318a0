//! Signed decision tokens for live playback.
//!
//! Compact HS256 tokens over canonical claims. Verification is ordered to
//! fail before any untrusted bytes are parsed: the signature is checked
//! first, then the header algorithm, then the claims. A token with
//! `alg=none` (or any non-HS256 algorithm) never reaches claim parsing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Maximum token lifetime.
pub const MAX_TTL_SECS: i64 = 120;
/// Clock skew tolerated during verification.
pub const SKEW_SECS: i64 = 30;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
    #[error("unsupported algorithm")]
    BadAlgorithm,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token expired")]
    Expired,
    #[error("issuer or audience mismatch")]
    WrongParty,
    #[error("ttl exceeds the {MAX_TTL_SECS}s cap")]
    TtlTooLong,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Canonical decision-token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    /// The service reference the decision applies to.
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    /// Final playback mode the token authorizes.
    pub mode: String,
    /// Fingerprint of the capabilities the decision was made against.
    pub cap_hash: String,
}

impl Claims {
    /// Build claims valid from `now` for `ttl_secs` (capped at
    /// [`MAX_TTL_SECS`]).
    pub fn new(
        iss: &str,
        aud: &str,
        service_ref: &str,
        mode: &str,
        cap_hash: &str,
        now: i64,
        ttl_secs: i64,
    ) -> Result<Self, TokenError> {
        if ttl_secs <= 0 || ttl_secs > MAX_TTL_SECS {
            return Err(TokenError::TtlTooLong);
        }
        Ok(Self {
            iss: iss.to_string(),
            aud: aud.to_string(),
            sub: service_ref.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            nbf: now,
            exp: now + ttl_secs,
            mode: mode.to_string(),
            cap_hash: cap_hash.to_string(),
        })
    }
}

/// Sign claims into a compact token.
pub fn sign(secret: &[u8], claims: &Claims) -> Result<String, TokenError> {
    if claims.exp - claims.iat > MAX_TTL_SECS {
        return Err(TokenError::TtlTooLong);
    }
    let header = Header {
        alg: "HS256".to_string(),
        typ: "JWT".to_string(),
    };
    let header_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).map_err(|_| TokenError::Malformed)?);
    let claims_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).map_err(|_| TokenError::Malformed)?);
    let signing_input = format!("{header_b64}.{claims_b64}");

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::Malformed)?;
    mac.update(signing_input.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{sig}"))
}

/// Verify a compact token and return its claims.
///
/// Order matters: signature bytes first, then algorithm, then claims.
pub fn verify(secret: &[u8], token: &str, iss: &str, aud: &str, now: i64) -> Result<Claims, TokenError> {
    let mut parts = token.split('.');
    let (header_b64, claims_b64, sig_b64) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(h), Some(c), Some(s), None) => (h, c, s),
        _ => return Err(TokenError::Malformed),
    };

    // 1. Signature. An alg=none token carries no valid HMAC and dies here,
    //    before either JSON segment is parsed.
    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64.as_bytes())
        .map_err(|_| TokenError::BadSignature)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::Malformed)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());
    mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

    // 2. Algorithm.
    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64.as_bytes())
        .map_err(|_| TokenError::Malformed)?;
    let header: Header =
        serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;
    if header.alg != "HS256" {
        return Err(TokenError::BadAlgorithm);
    }

    // 3. Claims.
    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_b64.as_bytes())
        .map_err(|_| TokenError::Malformed)?;
    let claims: Claims =
        serde_json::from_slice(&claims_bytes).map_err(|_| TokenError::Malformed)?;

    if claims.iss != iss || claims.aud != aud {
        return Err(TokenError::WrongParty);
    }
    if now + SKEW_SECS < claims.nbf || now + SKEW_SECS < claims.iat {
        return Err(TokenError::NotYetValid);
    }
    if now - SKEW_SECS > claims.exp {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}
