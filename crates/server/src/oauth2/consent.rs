//! Consent coordinator.
//!
//! Validates an authorization request against the client registry, decides
//! whether the user has to be asked, and turns the user's answer into an
//! approved grant. It performs no user-facing I/O; rendering the question and
//! collecting the answer belongs to the HTTP layer.

use crate::entity::oauth2_consent;
use crate::error::{AuthorizeError, OAuth2Error};
use crate::oauth2::flow::AuthorizationRequest;
use crate::oauth2::identity::AuthenticatedIdentity;
use crate::oauth2::registry::{Client, ClientRegistry, normalize_scope};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter,
};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use utoipa::ToSchema;

/// A validated request waiting for the user's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct PendingGrant {
    pub client_id: String,
    pub client_name: String,
    pub client_uri: String,
    pub scope: String,
    pub redirect_uri: String,
    /// The request named `redirect_uri` itself rather than relying on the
    /// client's only registered one.
    #[serde(skip)]
    pub redirect_uri_explicit: bool,
    pub state: Option<String>,
    pub user: AuthenticatedIdentity,
    /// A remembered approval already covers this request.
    pub previously_approved: bool,
}

impl PendingGrant {
    pub fn approve(&self) -> ApprovedGrant {
        ApprovedGrant {
            client_id: self.client_id.clone(),
            user_id: self.user.user_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            redirect_uri_explicit: self.redirect_uri_explicit,
            scope: self.scope.clone(),
            state: self.state.clone(),
        }
    }
}

/// Everything needed to mint an authorization code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedGrant {
    pub client_id: String,
    pub user_id: String,
    pub redirect_uri: String,
    /// Whether the token request has to repeat `redirect_uri`
    pub redirect_uri_explicit: bool,
    pub scope: String,
    pub state: Option<String>,
}

/// A request that passed registry checks.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub client: Client,
    pub redirect_uri: String,
    pub redirect_uri_explicit: bool,
    /// Normalized, defaulted to the client's registered scope
    pub scope: String,
}

/// Outcome of asking the user.
#[derive(Debug)]
pub enum Consent {
    Approved(ApprovedGrant),
    Denied,
    Error(OAuth2Error),
}

/// The user's answer as submitted by the consent form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsentAnswer {
    pub approved: bool,
    pub remember: bool,
}

impl ConsentAnswer {
    /// Only a literal `on` counts, anything else (including absence) is a no.
    pub fn from_form(confirm: Option<&str>, remember: Option<&str>) -> Self {
        Self {
            approved: confirm == Some("on"),
            remember: remember == Some("on"),
        }
    }
}

#[derive(Clone)]
pub struct ConsentCoordinator {
    registry: ClientRegistry,
    db: Arc<DatabaseConnection>,
    remember_enabled: bool,
}

impl ConsentCoordinator {
    pub fn new(
        registry: ClientRegistry,
        db: Arc<DatabaseConnection>,
        remember_enabled: bool,
    ) -> Self {
        Self {
            registry,
            db,
            remember_enabled,
        }
    }

    /// Validate `request` for `end_user` and describe what they are asked to
    /// approve.
    #[tracing::instrument(skip(self, end_user, request), fields(user_id = %end_user.user_id, client_id = ?request.client_id))]
    pub async fn get_consent_grant(
        &self,
        end_user: &AuthenticatedIdentity,
        request: &AuthorizationRequest,
    ) -> Result<PendingGrant, AuthorizeError> {
        let ValidatedRequest {
            client,
            redirect_uri,
            redirect_uri_explicit,
            scope,
        } = self.validate_request(request).await?;

        let previously_approved = self.remember_enabled
            && !request.forces_consent()
            && self
                .has_prior_approval(&end_user.user_id, &client.client_id, &scope)
                .await?;

        Ok(PendingGrant {
            client_id: client.client_id,
            client_name: client.metadata.client_name,
            client_uri: client.metadata.client_uri,
            scope,
            redirect_uri,
            redirect_uri_explicit,
            state: request.state.clone(),
            user: end_user.clone(),
            previously_approved,
        })
    }

    /// Check `request` against the client's registration.
    ///
    /// Problems with the client or redirect URI are returned as
    /// [`AuthorizeError::Direct`]; everything found after the redirect URI is
    /// trusted is returned as [`AuthorizeError::Redirect`].
    pub async fn validate_request(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<ValidatedRequest, AuthorizeError> {
        let client_id = request
            .client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AuthorizeError::Direct(OAuth2Error::InvalidRequest(
                    "Missing client_id parameter".into(),
                ))
            })?;

        let client = self.registry.lookup(client_id).await?.ok_or_else(|| {
            AuthorizeError::Direct(OAuth2Error::InvalidRequest("Unknown client".into()))
        })?;

        let requested_uri = request.redirect_uri.as_deref().filter(|u| !u.is_empty());
        let redirect_uri = match requested_uri {
            Some(uri) if client.is_redirect_uri_allowed(uri) => uri.to_string(),
            Some(_) => {
                return Err(AuthorizeError::Direct(OAuth2Error::InvalidRequest(
                    "redirect_uri is not registered for this client".into(),
                )));
            }
            None => client
                .default_redirect_uri()
                .ok_or_else(|| {
                    AuthorizeError::Direct(OAuth2Error::InvalidRequest(
                        "redirect_uri is required when several are registered".into(),
                    ))
                })?
                .to_string(),
        };

        let state = request.state.as_deref();
        let reject = |error| AuthorizeError::redirect(error, &redirect_uri, state);

        match request.response_type.as_deref() {
            None | Some("") => {
                return Err(reject(OAuth2Error::InvalidRequest(
                    "Missing response_type parameter".into(),
                )));
            }
            Some("code") => {}
            Some(other) => {
                return Err(reject(OAuth2Error::UnsupportedResponseType(format!(
                    "response_type '{other}' is not supported"
                ))));
            }
        }
        if !client.is_response_type_allowed("code") {
            return Err(reject(OAuth2Error::UnauthorizedClient(
                "Client is not registered for response_type 'code'".into(),
            )));
        }
        if !client.is_grant_type_allowed("authorization_code") {
            return Err(reject(OAuth2Error::UnauthorizedClient(
                "Client is not registered for the authorization_code grant".into(),
            )));
        }

        let scope = match request.scope.as_deref().map(normalize_scope) {
            Some(scope) if !scope.is_empty() => scope,
            _ => client.metadata.scope.clone(),
        };
        if !client.allows_scope(&scope) {
            return Err(reject(OAuth2Error::InvalidScope(
                "Requested scope exceeds the client's registered scope".into(),
            )));
        }

        Ok(ValidatedRequest {
            client,
            redirect_uri,
            redirect_uri_explicit: requested_uri.is_some(),
            scope,
        })
    }

    /// Turn the user's answer into a grant. Approvals are remembered when the
    /// user asked for it and the server allows it; denials never are.
    #[tracing::instrument(skip(self, pending), fields(client_id = %pending.client_id, user_id = %pending.user.user_id))]
    pub async fn resolve(&self, pending: &PendingGrant, answer: ConsentAnswer) -> Consent {
        if !answer.approved {
            tracing::info!("User denied authorization");
            return Consent::Denied;
        }

        let grant = pending.approve();
        if answer.remember && self.remember_enabled {
            if let Err(e) = self.remember(&grant).await {
                return Consent::Error(e.into());
            }
        }
        Consent::Approved(grant)
    }

    pub async fn has_prior_approval(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
    ) -> Result<bool, DbErr> {
        Ok(self
            .find_approval(user_id, client_id)
            .await?
            .is_some_and(|consent| consent.covers(scope)))
    }

    async fn find_approval(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<oauth2_consent::Model>, DbErr> {
        oauth2_consent::Entity::find()
            .filter(oauth2_consent::Column::UserId.eq(user_id))
            .filter(oauth2_consent::Column::ClientId.eq(client_id))
            .one(self.db.as_ref())
            .await
    }

    /// Store an approval, widening an existing one rather than replacing it.
    async fn remember(&self, grant: &ApprovedGrant) -> Result<(), DbErr> {
        let now = OffsetDateTime::now_utc();
        match self.find_approval(&grant.user_id, &grant.client_id).await? {
            Some(existing) => {
                let scope = merge_scopes(&existing.scope, &grant.scope);
                let mut active: oauth2_consent::ActiveModel = existing.into();
                active.scope = Set(scope);
                active.granted_at = Set(now);
                active.update(self.db.as_ref()).await?;
            }
            None => {
                oauth2_consent::ActiveModel {
                    id: Set(uuid::Uuid::new_v4().to_string()),
                    user_id: Set(grant.user_id.clone()),
                    client_id: Set(grant.client_id.clone()),
                    scope: Set(grant.scope.clone()),
                    granted_at: Set(now),
                }
                .insert(self.db.as_ref())
                .await?;
            }
        }
        Ok(())
    }
}

fn merge_scopes(existing: &str, added: &str) -> String {
    let mut merged: Vec<&str> = existing.split_whitespace().collect();
    for scope in added.split_whitespace() {
        if !merged.contains(&scope) {
            merged.push(scope);
        }
    }
    merged.join(" ")
}
