use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// OAuth2 protocol errors (RFC 6749 section 4.1.2.1 / 5.2, RFC 6750 section 3.1).
#[derive(Debug, Error)]
pub enum OAuth2Error {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized_client: {0}")]
    UnauthorizedClient(String),
    #[error("access_denied: the resource owner denied the request")]
    AccessDenied,
    #[error("unsupported_response_type: {0}")]
    UnsupportedResponseType(String),
    #[error("invalid_scope: {0}")]
    InvalidScope(String),
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("invalid_client: client authentication failed")]
    InvalidClient,
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),
    #[error("invalid_token: {0}")]
    InvalidToken(String),
    #[error("insufficient_scope: token requires '{0}' scope")]
    InsufficientScope(String),
    #[error("server_error: {0}")]
    Database(#[from] DbErr),
    #[error("server_error: {0}")]
    Internal(String),
}

impl OAuth2Error {
    /// The `error` code sent on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::AccessDenied => "access_denied",
            Self::UnsupportedResponseType(_) => "unsupported_response_type",
            Self::InvalidScope(_) => "invalid_scope",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::InvalidClient => "invalid_client",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::InvalidToken(_) => "invalid_token",
            Self::InsufficientScope(_) => "insufficient_scope",
            Self::Database(_) | Self::Internal(_) => "server_error",
        }
    }

    /// Human readable `error_description`. Internal details are never exposed.
    pub fn description(&self) -> Option<String> {
        match self {
            Self::InvalidRequest(d)
            | Self::UnauthorizedClient(d)
            | Self::UnsupportedResponseType(d)
            | Self::InvalidScope(d)
            | Self::InvalidGrant(d)
            | Self::UnsupportedGrantType(d)
            | Self::InvalidToken(d) => Some(d.clone()),
            Self::AccessDenied => Some("The user denied the request".to_string()),
            Self::InvalidClient => None,
            Self::InsufficientScope(scope) => Some(format!("Token requires '{scope}' scope")),
            Self::Database(_) | Self::Internal(_) => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidClient | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope(_) => StatusCode::FORBIDDEN,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn to_body(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.code().to_string(),
            error_description: self.description(),
        }
    }

    /// Redirect the user-agent back to the client with the error attached as
    /// query parameters. Only call this with a redirect URI that has already
    /// been matched against the client's registration.
    pub fn into_redirect(self, redirect_uri: &str, state: Option<&str>) -> Response {
        let mut redirect_url = match url::Url::parse(redirect_uri) {
            Ok(u) => u,
            Err(_) => return self.into_response(),
        };

        {
            let mut pairs = redirect_url.query_pairs_mut();
            pairs.append_pair("error", self.code());
            if let Some(desc) = self.description() {
                pairs.append_pair("error_description", &desc);
            }
            if let Some(s) = state.filter(|s| !s.is_empty()) {
                pairs.append_pair("state", s);
            }
        }

        Redirect::to(redirect_url.as_str()).into_response()
    }
}

impl IntoResponse for OAuth2Error {
    fn into_response(self) -> Response {
        match &self {
            Self::Database(e) => tracing::error!("Database error: {}", e),
            Self::Internal(e) => tracing::error!("Internal error: {}", e),
            _ => {}
        }

        let status = self.status();
        let mut response = (status, Json(self.to_body())).into_response();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = match self {
                Self::InvalidClient => "Basic",
                _ => "Bearer",
            };
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
        }
        response
    }
}

/// Failure at the authorization endpoint.
#[derive(Debug, Error)]
pub enum AuthorizeError {
    /// The client or redirect URI could not be trusted. Answered directly,
    /// never redirected.
    #[error("{0}")]
    Direct(OAuth2Error),
    /// Reported back to the client through its verified redirect URI.
    #[error("{error}")]
    Redirect {
        error: OAuth2Error,
        redirect_uri: String,
        state: Option<String>,
    },
}

impl AuthorizeError {
    pub fn redirect(error: OAuth2Error, redirect_uri: &str, state: Option<&str>) -> Self {
        Self::Redirect {
            error,
            redirect_uri: redirect_uri.to_string(),
            state: state.map(String::from),
        }
    }

    pub fn error(&self) -> &OAuth2Error {
        match self {
            Self::Direct(error) | Self::Redirect { error, .. } => error,
        }
    }
}

impl From<DbErr> for AuthorizeError {
    fn from(err: DbErr) -> Self {
        Self::Direct(OAuth2Error::Database(err))
    }
}

impl IntoResponse for AuthorizeError {
    fn into_response(self) -> Response {
        match self {
            Self::Direct(error) => error.into_response(),
            Self::Redirect {
                error,
                redirect_uri,
                state,
            } => error.into_redirect(&redirect_uri, state.as_deref()),
        }
    }
}

/// Error body for JSON responses.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// Client registration failures.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("{0} must contain at least one non-blank line")]
    EmptyField(&'static str),
    #[error("Unsupported token_endpoint_auth_method: {0}")]
    UnsupportedAuthMethod(String),
    #[error("Invalid redirect URI: {0}")]
    InvalidRedirectUri(String),
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

impl IntoResponse for RegistrationError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::Database(e) => {
                tracing::error!("Failed to persist client: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
            Self::InvalidRedirectUri(_) => (StatusCode::BAD_REQUEST, "invalid_redirect_uri"),
            Self::EmptyField(_) | Self::UnsupportedAuthMethod(_) => {
                (StatusCode::BAD_REQUEST, "invalid_client_metadata")
            }
        };
        let description = match &self {
            Self::Database(_) => None,
            other => Some(other.to_string()),
        };
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                error_description: description,
            }),
        )
            .into_response()
    }
}

/// Failures talking to the identity verification network.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Authentication with the identity network failed: {0}")]
    Auth(String),
    #[error("GraphQL error: {0}")]
    GraphQl(String),
    #[error("Unexpected response shape: {0}")]
    Decode(String),
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            OAuth2Error::InvalidGrant("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(OAuth2Error::InvalidClient.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            OAuth2Error::InvalidToken("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            OAuth2Error::InsufficientScope("profile".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            OAuth2Error::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_server_errors_hide_details() {
        let err = OAuth2Error::Database(DbErr::Custom("connection refused".into()));
        let body = err.to_body();
        assert_eq!(body.error, "server_error");
        assert!(body.error_description.is_none());
    }

    #[test]
    fn test_invalid_client_sets_basic_challenge() {
        let response = OAuth2Error::InvalidClient.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Basic"
        );
    }

    #[test]
    fn test_error_redirect_carries_state() {
        let response = OAuth2Error::AccessDenied
            .into_redirect("https://app.example/cb?x=1", Some("xyz"));
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(location.starts_with("https://app.example/cb?x=1&error=access_denied"));
        assert!(location.contains("state=xyz"));
    }

    #[test]
    fn test_direct_authorize_error_never_redirects() {
        let response =
            AuthorizeError::Direct(OAuth2Error::InvalidRequest("unknown client".into()))
                .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(header::LOCATION).is_none());
    }
}
