//! SeaORM entities for the authorization server's persisted state.

pub mod oauth2_authorization;
pub mod oauth2_client;
pub mod oauth2_consent;
pub mod oauth2_token;
pub mod oauth2_user;
