//! OAuth2 state management.
//!
//! Provides the state shared by every OAuth2 handler.

use crate::config::OAuth2Config;
use crate::entity::oauth2_user;
use crate::oauth2::consent::ConsentCoordinator;
use crate::oauth2::credentials::CredentialIssuer;
use crate::oauth2::registry::ClientRegistry;
use crate::oauth2::token::TokenEndpoint;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// OAuth2 state containing all components needed for the authorization server.
#[derive(Clone)]
pub struct OAuth2State {
    pub db: Arc<DatabaseConnection>,
    pub registry: ClientRegistry,
    pub issuer: CredentialIssuer,
    pub consent: ConsentCoordinator,
    pub tokens: TokenEndpoint,
    /// How long one authorize request may stay open
    pub flow_lifetime: Duration,
}

impl OAuth2State {
    pub fn new(db: Arc<DatabaseConnection>, config: &OAuth2Config) -> Self {
        let registry = ClientRegistry::new(db.clone());
        let issuer = CredentialIssuer::new(db.clone(), config);
        Self {
            consent: ConsentCoordinator::new(
                registry.clone(),
                db.clone(),
                config.remember_consent,
            ),
            tokens: TokenEndpoint::new(db.clone(), registry.clone(), issuer.clone()),
            registry,
            issuer,
            db,
            flow_lifetime: Duration::seconds(config.flow_lifetime),
        }
    }

    /// Get or create a user by username
    pub async fn get_or_create_user(
        &self,
        username: &str,
    ) -> Result<oauth2_user::Model, sea_orm::DbErr> {
        if let Some(user) = oauth2_user::Entity::find()
            .filter(oauth2_user::Column::Username.eq(username))
            .one(self.db.as_ref())
            .await?
        {
            return Ok(user);
        }

        let user = oauth2_user::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            username: Set(username.to_string()),
            created_at: Set(OffsetDateTime::now_utc()),
            verified_at: Set(None),
        };

        let user = user.insert(self.db.as_ref()).await?;
        tracing::info!(user_id = %user.id, "Created user");
        Ok(user)
    }

    pub async fn find_user(
        &self,
        user_id: &str,
    ) -> Result<Option<oauth2_user::Model>, sea_orm::DbErr> {
        oauth2_user::Entity::find_by_id(user_id)
            .one(self.db.as_ref())
            .await
    }
}

/// Stamp `verified_at` on a user. Existing stamps are kept.
pub async fn mark_user_verified(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Option<oauth2_user::Model>, sea_orm::DbErr> {
    let Some(user) = oauth2_user::Entity::find_by_id(user_id).one(db).await? else {
        return Ok(None);
    };
    if user.is_verified() {
        return Ok(Some(user));
    }
    let mut active: oauth2_user::ActiveModel = user.into();
    active.verified_at = Set(Some(OffsetDateTime::now_utc()));
    active.update(db).await.map(Some)
}
