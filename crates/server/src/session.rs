//! Signed session cookies.
//!
//! The browser session is an HS256 JWT in the `session` cookie. While a login
//! waits on identity verification the browser instead holds a `pending_login`
//! cookie, which names the user but does not authenticate them.

use crate::AppResources;
use crate::error::ErrorResponse;
use crate::oauth2::identity::AuthenticatedIdentity;
use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use cookie::{Cookie, SameSite};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const SESSION_COOKIE: &str = "session";
pub const PENDING_LOGIN_COOKIE: &str = "pending_login";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No session cookie")]
    Missing,
    #[error("Invalid session token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("Session token used for the wrong purpose")]
    WrongKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Session,
    PendingLogin,
}

impl SessionKind {
    pub fn cookie_name(&self) -> &'static str {
        match self {
            Self::Session => SESSION_COOKIE,
            Self::PendingLogin => PENDING_LOGIN_COOKIE,
        }
    }
}

/// JWT claims carried in session cookies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub exp: usize,
    pub sub: String,
    pub username: String,
    pub verified: bool,
    pub kind: SessionKind,
    /// Where to send the browser once a pending login completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
    /// Verification attempt a pending login waits on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<String>,
}

impl SessionClaims {
    pub fn new(identity: &AuthenticatedIdentity, kind: SessionKind, lifetime_secs: i64) -> Self {
        let exp = (OffsetDateTime::now_utc() + time::Duration::seconds(lifetime_secs))
            .unix_timestamp() as usize;
        Self {
            exp,
            sub: identity.user_id.clone(),
            username: identity.username.clone(),
            verified: identity.verified,
            kind,
            return_to: None,
            attempt: None,
        }
    }

    pub fn with_return_to(mut self, return_to: String) -> Self {
        self.return_to = Some(return_to);
        self
    }

    pub fn with_attempt(mut self, attempt: String) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn identity(&self) -> AuthenticatedIdentity {
        AuthenticatedIdentity {
            user_id: self.sub.clone(),
            username: self.username.clone(),
            verified: self.verified,
        }
    }

    /// Sign these claims.
    pub fn issue(&self, secret: &str) -> Result<String, SessionError> {
        Ok(encode(
            &Header::default(),
            self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )?)
    }
}

/// Verify a token's signature, expiry and purpose.
pub fn verify(secret: &str, token: &str, kind: SessionKind) -> Result<SessionClaims, SessionError> {
    let mut validation = Validation::default();
    validation.validate_exp = true;
    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    if data.claims.kind != kind {
        return Err(SessionError::WrongKind);
    }
    Ok(data.claims)
}

/// Read and verify the cookie for `kind` from the request's cookies.
pub fn from_jar(
    jar: &CookieJar,
    secret: &str,
    kind: SessionKind,
) -> Result<SessionClaims, SessionError> {
    let cookie = jar.get(kind.cookie_name()).ok_or(SessionError::Missing)?;
    verify(secret, cookie.value(), kind)
}

/// Cookie carrying a signed token of `kind`.
pub fn token_cookie(kind: SessionKind, token: String, max_age_secs: i64) -> Cookie<'static> {
    Cookie::build((kind.cookie_name(), token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age_secs))
        .build()
}

/// Removal cookie for `kind`; the path has to match the one it was set with.
pub fn removal_cookie(kind: SessionKind) -> Cookie<'static> {
    Cookie::build(kind.cookie_name()).path("/").build()
}

/// Only same-site relative paths are accepted as post-login destinations.
pub fn sanitize_return_to(return_to: Option<&str>) -> String {
    match return_to {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

/// Rejection for [`RequireIdentity`].
#[derive(Debug)]
pub struct SessionRejection(StatusCode, &'static str);

impl IntoResponse for SessionRejection {
    fn into_response(self) -> Response {
        (
            self.0,
            Json(ErrorResponse {
                error: self.1.to_string(),
                error_description: None,
            }),
        )
            .into_response()
    }
}

fn resources(parts: &Parts) -> Result<AppResources, SessionRejection> {
    parts.extensions.get::<AppResources>().cloned().ok_or_else(|| {
        tracing::error!("AppResources not found in extensions");
        SessionRejection(StatusCode::INTERNAL_SERVER_ERROR, "server_error")
    })
}

/// The logged-in user, if any.
pub struct CurrentIdentity(pub Option<AuthenticatedIdentity>);

impl<S> FromRequestParts<S> for CurrentIdentity
where
    S: Send + Sync,
{
    type Rejection = SessionRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = resources(parts)?;
        let jar = CookieJar::from_headers(&parts.headers);
        match from_jar(&jar, &resources.config.session_secret, SessionKind::Session) {
            Ok(claims) => Ok(Self(Some(claims.identity()))),
            Err(SessionError::Missing) => Ok(Self(None)),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unusable session cookie");
                Ok(Self(None))
            }
        }
    }
}

/// The logged-in user; answers 401 when there is none.
pub struct RequireIdentity(pub AuthenticatedIdentity);

impl<S> FromRequestParts<S> for RequireIdentity
where
    S: Send + Sync,
{
    type Rejection = SessionRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match CurrentIdentity::from_request_parts(parts, state).await? {
            CurrentIdentity(Some(identity)) => Ok(Self(identity)),
            CurrentIdentity(None) => Err(SessionRejection(
                StatusCode::UNAUTHORIZED,
                "login_required",
            )),
        }
    }
}
