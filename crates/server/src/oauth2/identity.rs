//! The end-user as seen by the authorization server.
//!
//! Handlers obtain an [`AuthenticatedIdentity`] from the session layer and pass
//! it into the registry and consent coordinator explicitly. Nothing in the
//! OAuth2 core reads cookies or request context on its own.

use crate::entity::oauth2_user;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AuthenticatedIdentity {
    pub user_id: String,
    pub username: String,
    /// Whether the identity network vouched for this user.
    pub verified: bool,
}

impl From<&oauth2_user::Model> for AuthenticatedIdentity {
    fn from(user: &oauth2_user::Model) -> Self {
        Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            verified: user.is_verified(),
        }
    }
}

/// Normalize a login handle.
///
/// Handles are phone-number-like: surrounding whitespace is dropped, and the
/// result must be non-empty, at most 64 characters and free of whitespace and
/// control characters.
pub fn normalize_username(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.chars().count() > 64
        || trimmed.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return None;
    }
    Some(trimmed.to_string())
}
