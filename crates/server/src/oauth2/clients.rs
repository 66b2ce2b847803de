//! Client registration endpoints.
//!
//! Logged-in users register OAuth2 clients and list the ones they own. The
//! secret is only ever shown in the registration response.

use crate::entity::oauth2_client::ClientMetadata;
use crate::error::{ErrorResponse, OAuth2Error, RegistrationError};
use crate::oauth2::registry::{Client, ClientRegistration};
use crate::oauth2::{ACCOUNT_TAG, state::OAuth2State};
use crate::session::RequireIdentity;
use axum::{
    Form, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Creates the client management router.
pub fn router() -> OpenApiRouter<OAuth2State> {
    OpenApiRouter::new().routes(routes!(register_client, list_clients))
}

/// A freshly registered client, including its secret.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisteredClient {
    pub client_id: String,
    /// Empty for public clients
    pub client_secret: String,
    pub client_id_issued_at: i64,
    #[serde(flatten)]
    pub metadata: ClientMetadata,
}

impl From<Client> for RegisteredClient {
    fn from(client: Client) -> Self {
        Self {
            client_id: client.client_id,
            client_secret: client.client_secret,
            client_id_issued_at: client.client_id_issued_at,
            metadata: client.metadata,
        }
    }
}

/// A client as listed for its owner.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClientSummary {
    pub client_id: String,
    pub client_id_issued_at: i64,
    #[serde(flatten)]
    pub metadata: ClientMetadata,
}

impl From<Client> for ClientSummary {
    fn from(client: Client) -> Self {
        Self {
            client_id: client.client_id,
            client_id_issued_at: client.client_id_issued_at,
            metadata: client.metadata,
        }
    }
}

/// Register a new OAuth2 client.
#[tracing::instrument(skip(state, identity, registration))]
#[utoipa::path(
    post,
    path = "/clients",
    tag = ACCOUNT_TAG,
    operation_id = "Register Client",
    summary = "Register an OAuth2 client",
    description = "Registers a client owned by the logged-in user. `grant_type`, `redirect_uri` and \
                   `response_type` take one value per line; blank lines are ignored and each must keep \
                   at least one value. `token_endpoint_auth_method` is one of `none`, \
                   `client_secret_basic` or `client_secret_post`; public (`none`) clients get no secret.\n\n\
                   The response is the only place the client secret is ever shown.",
    request_body(
        content = ClientRegistration,
        content_type = "application/x-www-form-urlencoded",
        description = "Client metadata"
    ),
    responses(
        (status = 201, description = "Client registered", body = RegisteredClient),
        (status = 400, description = "Invalid client metadata", body = ErrorResponse),
        (status = 401, description = "Not logged in", body = ErrorResponse),
    )
)]
pub async fn register_client(
    State(state): State<OAuth2State>,
    RequireIdentity(identity): RequireIdentity,
    Form(registration): Form<ClientRegistration>,
) -> Result<Response, RegistrationError> {
    let client = state.registry.register(&identity, registration).await?;
    Ok((StatusCode::CREATED, Json(RegisteredClient::from(client))).into_response())
}

/// List the caller's clients.
#[tracing::instrument(skip(state, identity))]
#[utoipa::path(
    get,
    path = "/clients",
    tag = ACCOUNT_TAG,
    operation_id = "List Clients",
    summary = "List the logged-in user's clients",
    description = "Returns every client owned by the logged-in user. Secrets are not included.",
    responses(
        (status = 200, description = "Owned clients", body = Vec<ClientSummary>),
        (status = 401, description = "Not logged in", body = ErrorResponse),
    )
)]
pub async fn list_clients(
    State(state): State<OAuth2State>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Json<Vec<ClientSummary>>, OAuth2Error> {
    let clients = state.registry.list_for_user(&identity.user_id).await?;
    Ok(Json(clients.into_iter().map(ClientSummary::from).collect()))
}
