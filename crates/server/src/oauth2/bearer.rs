//! Bearer token extractor for protected resources (RFC 6750).

use crate::AppResources;
use crate::entity::oauth2_token;
use crate::error::OAuth2Error;
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};

/// Scope required to read the user's claims.
pub const SCOPE_PROFILE: &str = "profile";

/// What a valid access token grants.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub user_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
}

impl AccessGrant {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn require_scope(&self, scope: &str) -> Result<(), OAuth2Error> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(OAuth2Error::InsufficientScope(scope.to_string()))
        }
    }
}

impl From<oauth2_token::Model> for AccessGrant {
    fn from(token: oauth2_token::Model) -> Self {
        Self {
            scopes: token.scopes_list(),
            user_id: token.user_id,
            client_id: token.client_id,
        }
    }
}

/// Token from an `Authorization: Bearer` header. The scheme name is
/// case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Axum extractor that validates OAuth2 bearer tokens against the token table.
pub struct BearerAuth(pub AccessGrant);

impl<S> FromRequestParts<S> for BearerAuth
where
    S: Send + Sync,
{
    type Rejection = OAuth2Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = parts
            .extensions
            .get::<AppResources>()
            .cloned()
            .ok_or_else(|| OAuth2Error::Internal("AppResources not found in extensions".into()))?;

        let access_token = bearer_token(&parts.headers).ok_or_else(|| {
            OAuth2Error::InvalidToken("Missing or malformed Authorization header".into())
        })?;

        let token = resources
            .oauth2
            .issuer
            .find_access_token(access_token)
            .await?
            .ok_or_else(|| OAuth2Error::InvalidToken("Unknown access token".into()))?;

        if token.is_revoked() {
            return Err(OAuth2Error::InvalidToken("Access token was revoked".into()));
        }
        if token.is_access_token_expired() {
            return Err(OAuth2Error::InvalidToken("Access token expired".into()));
        }

        Ok(Self(token.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&headers("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers("bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers("Basic abc")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_require_scope() {
        let grant = AccessGrant {
            user_id: "u".into(),
            client_id: "c".into(),
            scopes: vec!["profile".into()],
        };
        assert!(grant.require_scope("profile").is_ok());
        assert_eq!(
            grant.require_scope("email").unwrap_err().code(),
            "insufficient_scope"
        );
    }
}
