//! Authentication and authorization for the v3 API.
//!
//! Two credential kinds: bearer tokens with explicit scopes (programmatic
//! access) and a session ticket cookie issued by the login endpoint
//! (browsers). The cookie value is an HMAC-signed ticket; like the decision
//! token, the tag is verified before any field of the payload is parsed, so
//! a hand-crafted cookie never reaches the scope logic. `*` and `v3:*` imply
//! all subordinate scopes. Media streaming endpoints require the cookie; a
//! bearer token alone is rejected there.

use crate::config::AuthConfig;
use crate::server::problem::{Problem, RequestContext};
use crate::server::AppContext;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    extract::cookie::{Cookie, CookieJar},
    headers::{authorization::Bearer, Authorization},
    typed_header::TypedHeader,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const SESSION_COOKIE_NAME: &str = "recast_session";

pub const SCOPE_READ: &str = "v3:read";
pub const SCOPE_WRITE: &str = "v3:write";
pub const SCOPE_ADMIN: &str = "v3:admin";

/// Login request payload
#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login response; failures are problem documents like the rest of the API.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub username: String,
    pub expires_at: u64,
}

/// Signed session ticket carried in the cookie.
///
/// Wire form is `base64url(json) "." base64url(hmac-sha256(payload))`. The
/// payload is opaque to clients; only the server holds the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionTicket {
    username: String,
    issued_at: u64,
    expires_at: u64,
}

impl SessionTicket {
    fn new(username: &str, timeout_hours: u64) -> Self {
        let now = unix_now();
        Self {
            username: username.to_string(),
            issued_at: now,
            expires_at: now + timeout_hours * 3600,
        }
    }

    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }

    /// Serialize and sign the ticket.
    fn seal(&self, secret: &[u8]) -> String {
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(self).unwrap_or_default());
        let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
            return String::new();
        };
        mac.update(payload.as_bytes());
        let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{payload}.{tag}")
    }

    /// Verify the tag and only then parse the payload. An unsigned or
    /// tampered cookie dies here without any of its fields being read.
    fn open(secret: &[u8], value: &str) -> Option<Self> {
        let (payload, tag) = value.split_once('.')?;
        let tag = URL_SAFE_NO_PAD.decode(tag.as_bytes()).ok()?;
        let mut mac = HmacSha256::new_from_slice(secret).ok()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&tag).ok()?;

        let json = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Does a granted scope set satisfy a required scope? `*` and `v3:*` imply
/// everything under the v3 surface.
#[must_use]
pub fn scope_allows(granted: &[String], required: &str) -> bool {
    granted
        .iter()
        .any(|scope| scope == "*" || scope == "v3:*" || scope == required)
}

/// Resolve the caller's granted scopes, if any credential is valid.
fn granted_scopes(
    auth: &AuthConfig,
    secret: &[u8],
    bearer_token: Option<&str>,
    session_cookie: Option<&str>,
) -> Option<Vec<String>> {
    if let Some(token) = bearer_token {
        if let Some(api_token) = auth.tokens.iter().find(|t| t.token == token) {
            return Some(api_token.scopes.clone());
        }
    }
    if let Some(cookie) = session_cookie {
        if let Some(ticket) = SessionTicket::open(secret, cookie) {
            if ticket.is_live(unix_now()) {
                // Logged-in UI users get the full v3 surface.
                return Some(vec!["v3:*".to_string()]);
            }
        }
    }
    None
}

fn unauthorized(ctx: &RequestContext) -> Response {
    Problem::new(401, "unauthorized", "Authentication required")
        .request_id(ctx)
        .into_response()
}

fn forbidden(ctx: &RequestContext, required: &str) -> Response {
    Problem::new(403, "forbidden", "Insufficient scope")
        .detail(format!("required scope: {required}"))
        .request_id(ctx)
        .into_response()
}

async fn require_scope(
    ctx: AppContext,
    required: &'static str,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    jar: CookieJar,
    request: Request<Body>,
    next: Next,
) -> Response {
    let trace = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();

    if !ctx.config.server.auth.enabled {
        return next.run(request).await;
    }

    let bearer_token = bearer.as_ref().map(|b| b.token().to_string());
    let session_cookie = jar.get(SESSION_COOKIE_NAME).map(|c| c.value().to_string());

    match granted_scopes(
        &ctx.config.server.auth,
        &ctx.token_secret,
        bearer_token.as_deref(),
        session_cookie.as_deref(),
    ) {
        Some(scopes) if scope_allows(&scopes, required) => next.run(request).await,
        Some(_) => forbidden(&trace, required),
        None => unauthorized(&trace),
    }
}

/// Middleware requiring `v3:read`.
pub async fn require_read(
    State(ctx): State<AppContext>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    jar: CookieJar,
    request: Request<Body>,
    next: Next,
) -> Response {
    require_scope(ctx, SCOPE_READ, bearer, jar, request, next).await
}

/// Middleware requiring `v3:write`.
pub async fn require_write(
    State(ctx): State<AppContext>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    jar: CookieJar,
    request: Request<Body>,
    next: Next,
) -> Response {
    require_scope(ctx, SCOPE_WRITE, bearer, jar, request, next).await
}

/// Middleware requiring `v3:admin`.
pub async fn require_admin(
    State(ctx): State<AppContext>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    jar: CookieJar,
    request: Request<Body>,
    next: Next,
) -> Response {
    require_scope(ctx, SCOPE_ADMIN, bearer, jar, request, next).await
}

/// Middleware for media streaming paths: only the session ticket counts.
/// Bearer tokens are rejected here so leaked tokens cannot be replayed into
/// long-lived media pulls.
pub async fn require_media_cookie(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    request: Request<Body>,
    next: Next,
) -> Response {
    let trace = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();

    if !ctx.config.server.auth.enabled {
        return next.run(request).await;
    }

    let live = jar
        .get(SESSION_COOKIE_NAME)
        .and_then(|c| SessionTicket::open(&ctx.token_secret, c.value()))
        .map(|t| t.is_live(unix_now()))
        .unwrap_or(false);
    if live {
        next.run(request).await
    } else {
        unauthorized(&trace)
    }
}

/// Login handler: verify credentials, seal a ticket, set the cookie.
pub async fn login(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), Problem> {
    let auth = &ctx.config.server.auth;
    let (expected_username, password_hash) = match (&auth.username, &auth.password_hash) {
        (Some(u), Some(h)) => (u, h),
        _ => {
            return Err(Problem::new(
                503,
                "unavailable",
                "Authentication not configured",
            ));
        }
    };

    let credentials_ok = payload.username == *expected_username
        && bcrypt::verify(&payload.password, password_hash).unwrap_or(false);
    if !credentials_ok {
        return Err(Problem::new(401, "unauthorized", "Invalid credentials"));
    }

    let ticket = SessionTicket::new(&payload.username, auth.session_timeout_hours);
    let cookie = Cookie::build((SESSION_COOKIE_NAME, ticket.seal(&ctx.token_secret)))
        .path("/")
        .http_only(true)
        .same_site(axum_extra::extract::cookie::SameSite::Lax)
        .max_age(time::Duration::hours(auth.session_timeout_hours as i64))
        .build();

    Ok((
        jar.add(cookie),
        Json(LoginResponse {
            username: ticket.username,
            expires_at: ticket.expires_at,
        }),
    ))
}

/// Logout handler: drop the ticket cookie.
pub async fn logout(jar: CookieJar) -> (CookieJar, StatusCode) {
    let cookie = Cookie::build((SESSION_COOKIE_NAME, ""))
        .path("/")
        .max_age(time::Duration::ZERO)
        .build();

    (jar.remove(cookie), StatusCode::NO_CONTENT)
}

/// Generate a bcrypt password hash
pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
}

/// Generate a random API bearer token
pub fn generate_api_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build a cookie header value a test client can present directly. Requires
/// the server's ticket key, since unsigned values are rejected.
#[doc(hidden)]
pub fn test_session_cookie_value(secret: &[u8], username: &str) -> String {
    format!(
        "{SESSION_COOKIE_NAME}={}",
        SessionTicket::new(username, 1).seal(secret)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiToken;

    const SECRET: &[u8] = b"ticket-key-material-32-bytes!!!!";

    #[test]
    fn test_scope_allows() {
        let granted = vec![SCOPE_READ.to_string()];
        assert!(scope_allows(&granted, SCOPE_READ));
        assert!(!scope_allows(&granted, SCOPE_WRITE));

        let wildcard = vec!["v3:*".to_string()];
        assert!(scope_allows(&wildcard, SCOPE_READ));
        assert!(scope_allows(&wildcard, SCOPE_WRITE));
        assert!(scope_allows(&wildcard, SCOPE_ADMIN));

        let star = vec!["*".to_string()];
        assert!(scope_allows(&star, SCOPE_ADMIN));
    }

    #[test]
    fn test_granted_scopes_bearer() {
        let auth = AuthConfig {
            enabled: true,
            tokens: vec![ApiToken {
                token: "secret".into(),
                scopes: vec![SCOPE_READ.into(), SCOPE_WRITE.into()],
            }],
            ..Default::default()
        };
        let scopes = granted_scopes(&auth, SECRET, Some("secret"), None).unwrap();
        assert_eq!(scopes.len(), 2);
        assert!(granted_scopes(&auth, SECRET, Some("wrong"), None).is_none());
        assert!(granted_scopes(&auth, SECRET, None, None).is_none());
    }

    #[test]
    fn test_granted_scopes_cookie() {
        let auth = AuthConfig {
            enabled: true,
            ..Default::default()
        };
        let sealed = SessionTicket::new("user", 1).seal(SECRET);
        let scopes = granted_scopes(&auth, SECRET, None, Some(&sealed)).unwrap();
        assert!(scope_allows(&scopes, SCOPE_ADMIN));
    }

    #[test]
    fn test_ticket_roundtrip() {
        let ticket = SessionTicket::new("alice", 24);
        let opened = SessionTicket::open(SECRET, &ticket.seal(SECRET)).unwrap();
        assert_eq!(opened.username, "alice");
        assert!(opened.is_live(unix_now()));
    }

    #[test]
    fn test_unsigned_cookie_rejected() {
        // A bare base64(JSON) value with no tag never opens, regardless of
        // what claims it carries.
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&SessionTicket {
                username: "admin".into(),
                issued_at: 0,
                expires_at: u64::MAX,
            })
            .unwrap(),
        );
        assert!(SessionTicket::open(SECRET, &forged).is_none());

        let auth = AuthConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(granted_scopes(&auth, SECRET, None, Some(&forged)).is_none());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = SessionTicket::new("user", 1).seal(SECRET);
        assert!(SessionTicket::open(b"other-key", &sealed).is_none());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let sealed = SessionTicket::new("user", 1).seal(SECRET);
        let (_, tag) = sealed.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&SessionTicket {
                username: "admin".into(),
                issued_at: 0,
                expires_at: u64::MAX,
            })
            .unwrap(),
        );
        assert!(SessionTicket::open(SECRET, &format!("{forged_payload}.{tag}")).is_none());
    }

    #[test]
    fn test_expired_ticket_rejected() {
        let ticket = SessionTicket {
            username: "user".into(),
            issued_at: 0,
            expires_at: 1,
        };
        let sealed = ticket.seal(SECRET);
        // Signature still valid; liveness is what fails.
        let opened = SessionTicket::open(SECRET, &sealed).unwrap();
        assert!(!opened.is_live(unix_now()));

        let auth = AuthConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(granted_scopes(&auth, SECRET, None, Some(&sealed)).is_none());
    }

    #[test]
    fn test_malformed_cookie_shapes() {
        assert!(SessionTicket::open(SECRET, "").is_none());
        assert!(SessionTicket::open(SECRET, "no-dot-here").is_none());
        assert!(SessionTicket::open(SECRET, "a.b.c").is_none());
        assert!(SessionTicket::open(SECRET, "!!!.???").is_none());
    }
}
