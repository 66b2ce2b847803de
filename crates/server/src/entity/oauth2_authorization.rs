//! OAuth2 Authorization Code entity - short-lived, single-use codes exchanged for tokens.

use crate::oauth2::flow::FlowState;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth2_authorization")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub code: String,
    pub client_id: String,
    pub user_id: String,
    /// Only recorded when the authorize request named it; the token request
    /// must then repeat it.
    pub redirect_uri: Option<String>,
    pub scope: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    /// Set on first redemption. Codes are kept after use so replays can be detected.
    pub consumed_at: Option<OffsetDateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Check if this authorization code has expired
    pub fn is_expired(&self) -> bool {
        self.expires_at < OffsetDateTime::now_utc()
    }

    /// Check if this authorization code was already redeemed
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    /// Where this code sits in the authorization flow.
    pub fn state(&self) -> FlowState {
        if self.is_consumed() {
            FlowState::Exchanged
        } else if self.is_expired() {
            FlowState::Expired
        } else {
            FlowState::CodeIssued
        }
    }
}
