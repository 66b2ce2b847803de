//! Database-backed OAuth2 client registry.

use crate::entity::oauth2_client::{self, ClientMetadata, TokenEndpointAuthMethod};
use crate::error::RegistrationError;
use crate::oauth2::credentials::CredentialIssuer;
use crate::oauth2::identity::AuthenticatedIdentity;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter,
};
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use utoipa::ToSchema;

/// Raw registration form. List fields hold one entry per line.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ClientRegistration {
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_uri: String,
    /// Newline-delimited grant types
    #[serde(default)]
    pub grant_type: String,
    /// Newline-delimited redirect URIs
    #[serde(default)]
    pub redirect_uri: String,
    /// Newline-delimited response types
    #[serde(default)]
    pub response_type: String,
    /// Space-delimited scopes
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub token_endpoint_auth_method: String,
}

impl ClientRegistration {
    pub fn into_metadata(self) -> Result<ClientMetadata, RegistrationError> {
        let grant_types = non_empty("grant_type", split_by_lines(&self.grant_type))?;
        let redirect_uris = non_empty("redirect_uri", split_by_lines(&self.redirect_uri))?;
        let response_types = non_empty("response_type", split_by_lines(&self.response_type))?;

        for uri in &redirect_uris {
            validate_redirect_uri(uri)?;
        }

        let token_endpoint_auth_method = self
            .token_endpoint_auth_method
            .trim()
            .parse::<TokenEndpointAuthMethod>()
            .map_err(RegistrationError::UnsupportedAuthMethod)?;

        Ok(ClientMetadata {
            client_name: self.client_name.trim().to_string(),
            client_uri: self.client_uri.trim().to_string(),
            grant_types,
            redirect_uris,
            response_types,
            scope: normalize_scope(&self.scope),
            token_endpoint_auth_method,
        })
    }
}

/// Split a multi-line form field, dropping blank lines.
pub fn split_by_lines(value: &str) -> Vec<String> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Collapse a scope string to single-space separated tokens.
pub fn normalize_scope(scope: &str) -> String {
    scope.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(field: &'static str, values: Vec<String>) -> Result<Vec<String>, RegistrationError> {
    if values.is_empty() {
        Err(RegistrationError::EmptyField(field))
    } else {
        Ok(values)
    }
}

/// Redirect URIs must be absolute and carry no fragment (RFC 6749 section 3.1.2).
fn validate_redirect_uri(uri: &str) -> Result<(), RegistrationError> {
    let parsed =
        url::Url::parse(uri).map_err(|_| RegistrationError::InvalidRedirectUri(uri.to_string()))?;
    if parsed.fragment().is_some() || parsed.cannot_be_a_base() {
        return Err(RegistrationError::InvalidRedirectUri(uri.to_string()));
    }
    Ok(())
}

/// A registered client with its metadata decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub client_id: String,
    pub client_secret: String,
    pub client_id_issued_at: i64,
    pub user_id: String,
    pub metadata: ClientMetadata,
}

impl TryFrom<oauth2_client::Model> for Client {
    type Error = DbErr;

    fn try_from(model: oauth2_client::Model) -> Result<Self, Self::Error> {
        let metadata = model.metadata().map_err(|e| {
            DbErr::Custom(format!("corrupt metadata for client {}: {e}", model.id))
        })?;
        Ok(Self {
            client_id: model.id,
            client_secret: model.client_secret,
            client_id_issued_at: model.client_id_issued_at,
            user_id: model.user_id,
            metadata,
        })
    }
}

impl Client {
    pub fn auth_method(&self) -> TokenEndpointAuthMethod {
        self.metadata.token_endpoint_auth_method
    }

    pub fn is_public(&self) -> bool {
        !self.auth_method().requires_secret()
    }

    /// Exact string comparison against the registered URIs.
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        self.metadata.redirect_uris.iter().any(|u| u == uri)
    }

    /// The redirect URI to use when a request omits one. Only unambiguous
    /// when exactly one URI is registered.
    pub fn default_redirect_uri(&self) -> Option<&str> {
        match self.metadata.redirect_uris.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }

    pub fn is_grant_type_allowed(&self, grant_type: &str) -> bool {
        self.metadata.grant_types.iter().any(|g| g == grant_type)
    }

    pub fn is_response_type_allowed(&self, response_type: &str) -> bool {
        self.metadata.response_types.iter().any(|r| r == response_type)
    }

    /// Whether every requested scope is part of the registered scope.
    pub fn allows_scope(&self, requested: &str) -> bool {
        requested
            .split_whitespace()
            .all(|s| self.metadata.scope.split_whitespace().any(|a| a == s))
    }

    /// Constant-time secret check. Public clients never match.
    pub fn verify_secret(&self, presented: &str) -> bool {
        if self.is_public() || self.client_secret.is_empty() {
            return false;
        }
        self.client_secret
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into()
    }
}

#[derive(Clone)]
pub struct ClientRegistry {
    db: Arc<DatabaseConnection>,
}

impl ClientRegistry {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Validate and persist a new client owned by `owner`.
    #[tracing::instrument(skip(self, registration), fields(user_id = %owner.user_id))]
    pub async fn register(
        &self,
        owner: &AuthenticatedIdentity,
        registration: ClientRegistration,
    ) -> Result<Client, RegistrationError> {
        let metadata = registration.into_metadata()?;

        let mut client_id = CredentialIssuer::new_client_id();
        while self.lookup(&client_id).await?.is_some() {
            client_id = CredentialIssuer::new_client_id();
        }

        let client_secret = if metadata.token_endpoint_auth_method.requires_secret() {
            CredentialIssuer::new_client_secret()
        } else {
            String::new()
        };

        let encoded = serde_json::to_string(&metadata)
            .map_err(|e| RegistrationError::Database(DbErr::Custom(e.to_string())))?;

        let model = oauth2_client::ActiveModel {
            id: Set(client_id),
            client_secret: Set(client_secret),
            client_id_issued_at: Set(OffsetDateTime::now_utc().unix_timestamp()),
            user_id: Set(owner.user_id.clone()),
            client_metadata: Set(encoded),
        }
        .insert(self.db.as_ref())
        .await?;

        tracing::info!(
            client_id = %model.id,
            auth_method = %metadata.token_endpoint_auth_method,
            "Registered OAuth2 client"
        );

        Ok(Client {
            client_id: model.id,
            client_secret: model.client_secret,
            client_id_issued_at: model.client_id_issued_at,
            user_id: model.user_id,
            metadata,
        })
    }

    pub async fn lookup(&self, client_id: &str) -> Result<Option<Client>, DbErr> {
        oauth2_client::Entity::find_by_id(client_id)
            .one(self.db.as_ref())
            .await?
            .map(Client::try_from)
            .transpose()
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Client>, DbErr> {
        oauth2_client::Entity::find()
            .filter(oauth2_client::Column::UserId.eq(user_id))
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(Client::try_from)
            .collect()
    }
}
