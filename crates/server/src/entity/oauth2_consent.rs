//! Remembered consent approvals. Denials are never stored.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth2_consent")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub client_id: String,
    /// Space-separated scopes the user approved
    pub scope: String,
    pub granted_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether this approval covers every requested scope.
    pub fn covers(&self, requested: &str) -> bool {
        requested
            .split_whitespace()
            .all(|s| self.scope.split_whitespace().any(|granted| granted == s))
    }
}
