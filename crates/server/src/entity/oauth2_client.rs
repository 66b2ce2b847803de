//! OAuth2 Client entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth2_client")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Empty for clients registered with `token_endpoint_auth_method = none`
    pub client_secret: String,
    /// Unix timestamp (seconds)
    pub client_id_issued_at: i64,
    /// Owning user
    pub user_id: String,
    /// JSON encoded [`ClientMetadata`]
    #[sea_orm(column_type = "Text")]
    pub client_metadata: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::oauth2_user::Entity",
        from = "Column::UserId",
        to = "super::oauth2_user::Column::Id"
    )]
    User,
}

impl Related<super::oauth2_user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse the stored metadata blob
    pub fn metadata(&self) -> Result<ClientMetadata, serde_json::Error> {
        serde_json::from_str(&self.client_metadata)
    }
}

/// Registered client metadata (RFC 7591 field names).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ClientMetadata {
    pub client_name: String,
    pub client_uri: String,
    pub grant_types: Vec<String>,
    pub redirect_uris: Vec<String>,
    pub response_types: Vec<String>,
    /// Space-delimited
    pub scope: String,
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
}

/// How a client authenticates at the token endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    /// Public client, no secret.
    None,
    #[default]
    ClientSecretBasic,
    ClientSecretPost,
}

impl TokenEndpointAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
        }
    }

    pub fn requires_secret(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for TokenEndpointAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenEndpointAuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "client_secret_basic" => Ok(Self::ClientSecretBasic),
            "client_secret_post" => Ok(Self::ClientSecretPost),
            other => Err(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_method_parses_known_values_only() {
        assert_eq!(
            "none".parse::<TokenEndpointAuthMethod>(),
            Ok(TokenEndpointAuthMethod::None)
        );
        assert_eq!(
            "client_secret_post".parse::<TokenEndpointAuthMethod>(),
            Ok(TokenEndpointAuthMethod::ClientSecretPost)
        );
        assert!("private_key_jwt".parse::<TokenEndpointAuthMethod>().is_err());
        assert!("".parse::<TokenEndpointAuthMethod>().is_err());
    }

    #[test]
    fn metadata_serializes_auth_method_as_snake_case() {
        let metadata = ClientMetadata {
            token_endpoint_auth_method: TokenEndpointAuthMethod::ClientSecretBasic,
            ..Default::default()
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["token_endpoint_auth_method"], "client_secret_basic");
    }
}
