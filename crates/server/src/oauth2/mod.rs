//! OAuth2 Authorization Server module.
//!
//! A minimal authorization server built around the authorization-code grant
//! with an explicit consent step.
//!
//! ## Supported Flows
//!
//! - Authorization Code
//! - Refresh Token (with rotation)
//!
//! ## Endpoints
//!
//! - `GET /oauth/authorize` - Validate a request and describe the pending grant
//! - `POST /oauth/authorize` - Submit the consent decision
//! - `POST /oauth/token` - Token endpoint
//! - `GET /oauth/userinfo` - Claims about the token's user
//! - `POST /clients`, `GET /clients` - Client registration
//! - `POST /login`, `GET /login/status`, `GET /logout` - End-user session

pub mod bearer;
pub mod clients;
pub mod consent;
pub mod credentials;
pub mod endpoints;
pub mod flow;
pub mod identity;
pub mod login;
pub mod registry;
mod state;
pub mod token;

pub use endpoints::router;
pub use identity::AuthenticatedIdentity;
pub use state::{OAuth2State, mark_user_verified};

use utoipa_axum::router::OpenApiRouter;

/// OpenAPI tag for OAuth2 endpoints
pub const OAUTH2_TAG: &str = "OAuth2";
/// OpenAPI tag for client management and login endpoints
pub const ACCOUNT_TAG: &str = "Account";

/// Routes mounted at the root: client registration and the login session.
pub fn account_router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .merge(clients::router())
        .merge(login::router())
        .with_state(state)
}
