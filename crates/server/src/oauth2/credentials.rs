//! Credential issuer.
//!
//! Mints client identifiers and secrets, authorization codes and token pairs,
//! and owns every write to the code and token tables. Redemption and rotation
//! are conditional updates so that concurrent callers cannot both win.

use crate::config::OAuth2Config;
use crate::entity::{oauth2_authorization, oauth2_token};
use crate::oauth2::consent::ApprovedGrant;
use base64::Engine;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, sea_query::Expr,
};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Largest multiple of the alphabet size that fits in a byte. Bytes at or above
/// it are discarded so every character is equally likely.
const REJECTION_BOUND: u8 = (256 / ALPHANUMERIC.len() * ALPHANUMERIC.len()) as u8;

pub const CLIENT_ID_LENGTH: usize = 24;
pub const CLIENT_SECRET_LENGTH: usize = 48;

/// Random alphanumeric string drawn from the OS CSPRNG.
pub fn random_alphanumeric(len: usize) -> String {
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        getrandom::fill(&mut buf).expect("Failed to generate random bytes");
        for byte in buf {
            if byte >= REJECTION_BOUND {
                continue;
            }
            out.push(ALPHANUMERIC[byte as usize % ALPHANUMERIC.len()] as char);
            if out.len() == len {
                break;
            }
        }
    }
    out
}

/// What a new token pair is issued for.
#[derive(Debug, Clone)]
pub struct TokenGrant<'a> {
    pub client_id: &'a str,
    pub user_id: &'a str,
    pub scope: &'a str,
    /// Code the chain started from, inherited across refreshes.
    pub authorization_code: Option<&'a str>,
    pub with_refresh_token: bool,
}

#[derive(Clone)]
pub struct CredentialIssuer {
    db: Arc<DatabaseConnection>,
    access_token_lifetime: Duration,
    refresh_token_lifetime: Duration,
    authorization_code_lifetime: Duration,
}

impl CredentialIssuer {
    pub fn new(db: Arc<DatabaseConnection>, config: &OAuth2Config) -> Self {
        Self {
            db,
            access_token_lifetime: Duration::seconds(config.access_token_lifetime),
            refresh_token_lifetime: Duration::seconds(config.refresh_token_lifetime),
            authorization_code_lifetime: Duration::seconds(config.authorization_code_lifetime),
        }
    }

    pub fn new_client_id() -> String {
        random_alphanumeric(CLIENT_ID_LENGTH)
    }

    pub fn new_client_secret() -> String {
        random_alphanumeric(CLIENT_SECRET_LENGTH)
    }

    /// 256 bits of randomness, URL-safe base64 without padding.
    pub fn new_token() -> String {
        let mut bytes = [0u8; 32];
        getrandom::fill(&mut bytes).expect("Failed to generate random bytes");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Access token lifetime in seconds, as reported in `expires_in`.
    pub fn access_token_lifetime(&self) -> i64 {
        self.access_token_lifetime.whole_seconds()
    }

    /// Persist a fresh authorization code for an approved grant.
    #[tracing::instrument(skip(self, grant), fields(client_id = %grant.client_id, user_id = %grant.user_id))]
    pub async fn new_authorization_code(
        &self,
        grant: &ApprovedGrant,
    ) -> Result<oauth2_authorization::Model, DbErr> {
        let now = OffsetDateTime::now_utc();
        let code = oauth2_authorization::ActiveModel {
            code: Set(Self::new_token()),
            client_id: Set(grant.client_id.clone()),
            user_id: Set(grant.user_id.clone()),
            redirect_uri: Set(grant
                .redirect_uri_explicit
                .then(|| grant.redirect_uri.clone())),
            scope: Set(grant.scope.clone()),
            created_at: Set(now),
            expires_at: Set(now + self.authorization_code_lifetime),
            consumed_at: Set(None),
        };
        code.insert(self.db.as_ref()).await
    }

    pub async fn find_authorization_code(
        &self,
        code: &str,
    ) -> Result<Option<oauth2_authorization::Model>, DbErr> {
        oauth2_authorization::Entity::find_by_id(code)
            .one(self.db.as_ref())
            .await
    }

    /// Mark a code consumed if nobody has yet.
    ///
    /// Returns `false` when another redemption got there first. Must run on the
    /// same transaction that issues the resulting token.
    pub async fn consume_authorization_code<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
    ) -> Result<bool, DbErr> {
        let result = oauth2_authorization::Entity::update_many()
            .col_expr(
                oauth2_authorization::Column::ConsumedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(oauth2_authorization::Column::Code.eq(code))
            .filter(oauth2_authorization::Column::ConsumedAt.is_null())
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Persist an access token, plus a refresh token when requested.
    pub async fn new_access_token<C: ConnectionTrait>(
        &self,
        conn: &C,
        grant: TokenGrant<'_>,
    ) -> Result<oauth2_token::Model, DbErr> {
        let now = OffsetDateTime::now_utc();
        let (refresh_token, refresh_token_expires_at) = if grant.with_refresh_token {
            (
                Some(Self::new_token()),
                Some(now + self.refresh_token_lifetime),
            )
        } else {
            (None, None)
        };

        let token = oauth2_token::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            access_token: Set(Self::new_token()),
            refresh_token: Set(refresh_token),
            token_type: Set("Bearer".to_string()),
            client_id: Set(grant.client_id.to_string()),
            user_id: Set(grant.user_id.to_string()),
            scope: Set(grant.scope.to_string()),
            authorization_code: Set(grant.authorization_code.map(String::from)),
            access_token_expires_at: Set(now + self.access_token_lifetime),
            refresh_token_expires_at: Set(refresh_token_expires_at),
            created_at: Set(now),
            revoked_at: Set(None),
        };
        token.insert(conn).await
    }

    /// Revoke a single token if it is still live. Returns `false` if it was
    /// already revoked, which during rotation means a concurrent refresh won.
    pub async fn revoke_token<C: ConnectionTrait>(
        &self,
        conn: &C,
        token_id: &str,
    ) -> Result<bool, DbErr> {
        let result = oauth2_token::Entity::update_many()
            .col_expr(
                oauth2_token::Column::RevokedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(oauth2_token::Column::Id.eq(token_id))
            .filter(oauth2_token::Column::RevokedAt.is_null())
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Revoke every live token issued from `code`, including refreshed ones.
    pub async fn revoke_derived_tokens(&self, code: &str) -> Result<u64, DbErr> {
        let result = oauth2_token::Entity::update_many()
            .col_expr(
                oauth2_token::Column::RevokedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(oauth2_token::Column::AuthorizationCode.eq(code))
            .filter(oauth2_token::Column::RevokedAt.is_null())
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn find_access_token(
        &self,
        access_token: &str,
    ) -> Result<Option<oauth2_token::Model>, DbErr> {
        oauth2_token::Entity::find()
            .filter(oauth2_token::Column::AccessToken.eq(access_token))
            .one(self.db.as_ref())
            .await
    }

    pub async fn find_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<oauth2_token::Model>, DbErr> {
        oauth2_token::Entity::find()
            .filter(oauth2_token::Column::RefreshToken.eq(refresh_token))
            .one(self.db.as_ref())
            .await
    }
}
