//! Token endpoint logic (RFC 6749 sections 4.1.3 and 6).
//!
//! Client authentication, code redemption and refresh-token rotation. The HTTP
//! handler in `endpoints` only extracts credentials and renders the result.

use crate::entity::oauth2_token;
use crate::error::OAuth2Error;
use crate::oauth2::credentials::{CredentialIssuer, TokenGrant};
use crate::oauth2::flow::FlowState;
use crate::oauth2::registry::{Client, ClientRegistry, normalize_scope};
use axum::http::{HeaderMap, header};
use base64::Engine;
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Token request form.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    /// `authorization_code` or `refresh_token`
    pub grant_type: Option<String>,
    /// Authorization code (authorization_code grant)
    pub code: Option<String>,
    /// Must equal the redirect URI the code was issued for
    pub redirect_uri: Option<String>,
    /// Refresh token (refresh_token grant)
    pub refresh_token: Option<String>,
    /// Optional narrowing of the scope on refresh
    pub scope: Option<String>,
    /// Client identifier (client_secret_post / none)
    pub client_id: Option<String>,
    /// Client secret (client_secret_post)
    pub client_secret: Option<String>,
}

/// Successful token response (RFC 6749 section 5.1).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    /// Seconds until the access token expires
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

impl TokenResponse {
    fn from_model(token: oauth2_token::Model, expires_in: i64) -> Self {
        Self {
            access_token: token.access_token,
            token_type: token.token_type,
            expires_in,
            refresh_token: token.refresh_token,
            scope: token.scope,
        }
    }
}

/// Where the client presented its credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// `Authorization: Basic` header
    Basic,
    /// `client_id` / `client_secret` form fields
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub source: CredentialSource,
}

impl ClientCredentials {
    /// Read credentials from the Basic header or the form body.
    ///
    /// Using both at once is rejected (RFC 6749 section 2.3).
    pub fn extract(headers: &HeaderMap, form: &TokenRequest) -> Result<Self, OAuth2Error> {
        let basic = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "));

        if let Some(encoded) = basic {
            if form.client_secret.is_some() {
                return Err(OAuth2Error::InvalidRequest(
                    "Client credentials must be sent in only one place".into(),
                ));
            }
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or(OAuth2Error::InvalidClient)?;
            let (id, secret) = decoded.split_once(':').ok_or(OAuth2Error::InvalidClient)?;
            // Credentials are form-urlencoded before base64 (RFC 6749 section 2.3.1).
            let id = urlencoding::decode(id).map_err(|_| OAuth2Error::InvalidClient)?;
            let secret = urlencoding::decode(secret).map_err(|_| OAuth2Error::InvalidClient)?;
            if let Some(form_id) = form.client_id.as_deref()
                && form_id != id
            {
                return Err(OAuth2Error::InvalidClient);
            }
            return Ok(Self {
                client_id: id.into_owned(),
                client_secret: Some(secret.into_owned()),
                source: CredentialSource::Basic,
            });
        }

        let client_id = form
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OAuth2Error::InvalidRequest("client_id is required".into()))?;
        Ok(Self {
            client_id,
            client_secret: form.client_secret.clone(),
            source: CredentialSource::Body,
        })
    }
}

#[derive(Clone)]
pub struct TokenEndpoint {
    db: Arc<DatabaseConnection>,
    registry: ClientRegistry,
    issuer: CredentialIssuer,
}

impl TokenEndpoint {
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: ClientRegistry,
        issuer: CredentialIssuer,
    ) -> Self {
        Self {
            db,
            registry,
            issuer,
        }
    }

    /// Authenticate the client, then dispatch on `grant_type`.
    #[tracing::instrument(skip_all, fields(client_id = %credentials.client_id, grant_type = ?request.grant_type))]
    pub async fn exchange(
        &self,
        request: TokenRequest,
        credentials: ClientCredentials,
    ) -> Result<TokenResponse, OAuth2Error> {
        let grant_type = request
            .grant_type
            .clone()
            .filter(|g| !g.is_empty())
            .ok_or_else(|| OAuth2Error::InvalidRequest("grant_type is required".into()))?;

        let client = self.authenticate(&credentials).await?;

        if grant_type != GRANT_AUTHORIZATION_CODE && grant_type != GRANT_REFRESH_TOKEN {
            return Err(OAuth2Error::UnsupportedGrantType(format!(
                "grant_type '{grant_type}' is not supported"
            )));
        }
        if !client.is_grant_type_allowed(&grant_type) {
            return Err(OAuth2Error::UnauthorizedClient(format!(
                "Client is not registered for the {grant_type} grant"
            )));
        }

        if grant_type == GRANT_AUTHORIZATION_CODE {
            self.exchange_code(&client, request).await
        } else {
            self.refresh(&client, request).await
        }
    }

    /// Check credentials against the client's registered auth method.
    pub async fn authenticate(&self, credentials: &ClientCredentials) -> Result<Client, OAuth2Error> {
        use crate::entity::oauth2_client::TokenEndpointAuthMethod as Method;

        let client = self
            .registry
            .lookup(&credentials.client_id)
            .await?
            .ok_or(OAuth2Error::InvalidClient)?;

        let presented = credentials.client_secret.as_deref();
        let ok = match (client.auth_method(), credentials.source) {
            (Method::None, CredentialSource::Body) => presented.is_none_or(str::is_empty),
            (Method::ClientSecretBasic, CredentialSource::Basic)
            | (Method::ClientSecretPost, CredentialSource::Body) => {
                presented.is_some_and(|secret| client.verify_secret(secret))
            }
            _ => false,
        };

        if !ok {
            tracing::info!(
                auth_method = %client.auth_method(),
                source = ?credentials.source,
                "Client authentication failed"
            );
            return Err(OAuth2Error::InvalidClient);
        }
        Ok(client)
    }

    async fn exchange_code(
        &self,
        client: &Client,
        request: TokenRequest,
    ) -> Result<TokenResponse, OAuth2Error> {
        let code = request
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuth2Error::InvalidRequest("code is required".into()))?;

        let record = self
            .issuer
            .find_authorization_code(&code)
            .await?
            .ok_or_else(|| OAuth2Error::InvalidGrant("Authorization code not found".into()))?;

        match record.state() {
            FlowState::Exchanged => {
                self.handle_replay(&record.code, &record.client_id, &record.user_id)
                    .await?;
                return Err(OAuth2Error::InvalidGrant(
                    "Authorization code has already been used".into(),
                ));
            }
            FlowState::Expired => {
                return Err(OAuth2Error::InvalidGrant(
                    "Authorization code expired".into(),
                ));
            }
            _ => {}
        }

        if record.client_id != client.client_id {
            return Err(OAuth2Error::InvalidGrant(
                "Authorization code was issued to another client".into(),
            ));
        }
        if let Some(expected) = record.redirect_uri.as_deref()
            && request.redirect_uri.as_deref() != Some(expected)
        {
            return Err(OAuth2Error::InvalidGrant("Redirect URI mismatch".into()));
        }

        let txn = self.db.begin().await?;
        if !self
            .issuer
            .consume_authorization_code(&txn, &record.code)
            .await?
        {
            txn.rollback().await?;
            self.handle_replay(&record.code, &record.client_id, &record.user_id)
                .await?;
            return Err(OAuth2Error::InvalidGrant(
                "Authorization code has already been used".into(),
            ));
        }
        let token = self
            .issuer
            .new_access_token(
                &txn,
                TokenGrant {
                    client_id: &client.client_id,
                    user_id: &record.user_id,
                    scope: &record.scope,
                    authorization_code: Some(&record.code),
                    with_refresh_token: client.is_grant_type_allowed(GRANT_REFRESH_TOKEN),
                },
            )
            .await?;
        txn.commit().await?;

        tracing::info!(user_id = %record.user_id, scope = %record.scope, "Exchanged authorization code");
        Ok(TokenResponse::from_model(
            token,
            self.issuer.access_token_lifetime(),
        ))
    }

    async fn handle_replay(&self, code: &str, client_id: &str, user_id: &str) -> Result<(), OAuth2Error> {
        let revoked = self.issuer.revoke_derived_tokens(code).await?;
        tracing::warn!(
            security_event = "authorization_code_replay",
            client_id,
            user_id,
            revoked_tokens = revoked,
            "Authorization code presented twice; revoked tokens issued from it"
        );
        Ok(())
    }

    async fn refresh(&self, client: &Client, request: TokenRequest) -> Result<TokenResponse, OAuth2Error> {
        let presented = request
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OAuth2Error::InvalidRequest("refresh_token is required".into()))?;

        let existing = self
            .issuer
            .find_refresh_token(&presented)
            .await?
            .ok_or_else(|| OAuth2Error::InvalidGrant("Refresh token not found".into()))?;

        if existing.client_id != client.client_id {
            return Err(OAuth2Error::InvalidGrant(
                "Refresh token was issued to another client".into(),
            ));
        }
        if existing.is_revoked() || existing.is_refresh_token_expired() {
            return Err(OAuth2Error::InvalidGrant(
                "Refresh token is revoked or expired".into(),
            ));
        }

        let scope = match request.scope.as_deref().map(normalize_scope) {
            Some(requested) if !requested.is_empty() => {
                if !requested.split_whitespace().all(|s| existing.has_scope(s)) {
                    return Err(OAuth2Error::InvalidScope(
                        "Requested scope exceeds the original grant".into(),
                    ));
                }
                requested
            }
            _ => existing.scope.clone(),
        };

        let txn = self.db.begin().await?;
        if !self.issuer.revoke_token(&txn, &existing.id).await? {
            txn.rollback().await?;
            return Err(OAuth2Error::InvalidGrant(
                "Refresh token is revoked or expired".into(),
            ));
        }
        let token = self
            .issuer
            .new_access_token(
                &txn,
                TokenGrant {
                    client_id: &client.client_id,
                    user_id: &existing.user_id,
                    scope: &scope,
                    authorization_code: existing.authorization_code.as_deref(),
                    with_refresh_token: true,
                },
            )
            .await?;
        txn.commit().await?;

        tracing::info!(user_id = %existing.user_id, "Rotated refresh token");
        Ok(TokenResponse::from_model(
            token,
            self.issuer.access_token_lifetime(),
        ))
    }
}
