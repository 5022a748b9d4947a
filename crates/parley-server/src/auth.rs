//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs whose `sub` claim is the user id. They are read
//! from the `Authorization: Bearer` header or, for `WebSocket` clients that
//! cannot set headers, from a `token` query parameter.

use std::fmt;
use std::time::Duration;

use axum::extract::{Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Uri};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parley_core::model::UserProfile;
use parley_core::{ChatError, UserId};
use parley_settings::AuthSettings;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ApiError;
use crate::server::AppState;

/// Clock skew tolerated when checking `exp`.
const LEEWAY_SECS: u64 = 5;

/// Why a request could not be authenticated.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No token in the header or query string.
    #[error("no authentication token provided")]
    Missing,

    /// The token's `exp` has passed.
    #[error("authentication token has expired")]
    Expired,

    /// Bad signature, malformed token, or missing claims.
    #[error("invalid authentication token: {0}")]
    Invalid(String),

    /// The token names a user that does not exist.
    #[error("unknown user {0}")]
    UnknownUser(UserId),

    /// Signing a new token failed.
    #[error("failed to sign token: {0}")]
    Sign(String),
}

/// JWT claims carried by session tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Issues and verifies session tokens with a shared secret.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenAuthority {
    /// Authority signing with `secret`; issued tokens live for `ttl`.
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    /// Authority from the `auth` settings section.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(&settings.token_secret, Duration::from_secs(settings.token_ttl_secs))
    }

    /// Token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a token for `user`, valid from now.
    pub fn issue(&self, user: &UserId) -> Result<String, AuthError> {
        self.issue_at(user, Utc::now())
    }

    fn issue_at(&self, user: &UserId, now: DateTime<Utc>) -> Result<String, AuthError> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: user.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp().saturating_add(ttl),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Sign(e.to_string()))
    }

    /// Check the signature and expiry and return the token's user id.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        Ok(UserId::from(data.claims.sub.as_str()))
    }
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Pull a bearer token from the `Authorization` header, falling back to
/// the `token` query parameter.
pub fn bearer_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_owned());
    }
    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
}

/// Resolve the caller of a request to a known user.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<UserProfile, ApiError> {
    let token = bearer_token(headers, uri).ok_or(AuthError::Missing)?;
    let user_id = state.auth.verify(&token)?;
    match state.engine.authenticate(&user_id).await {
        Ok(user) => Ok(user),
        Err(ChatError::Unauthorized { .. }) => Err(AuthError::UnknownUser(user_id).into()),
        Err(e) => Err(e.into()),
    }
}

/// Middleware that authenticates the request and stores the caller's
/// [`UserProfile`] as a request extension.
pub async fn require_user(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, request.headers(), request.uri()).await?;
    debug!(user_id = %user.id, path = %request.uri().path(), "request authenticated");
    let _ = request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}
