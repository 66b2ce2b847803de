//! TNID company API client.
//!
//! Authenticates with client credentials at `{api_url}/auth/token` and talks
//! GraphQL to `{api_url}/company`. A person is verified once they accepted our
//! B2C connection request.

use super::{Contact, IdentityVerifier, VerificationStatus};
use crate::config::VerificationConfig;
use crate::error::VerificationError;
use crate::oauth2::identity::AuthenticatedIdentity;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::Mutex;

const CONNECTION_TYPE: &str = "OTHER";

const USERS_QUERY: &str = r#"
query ($telephoneNumber: String, $limit: Int) {
  users(telephoneNumber: $telephoneNumber, limit: $limit) { id }
}"#;

const CREATE_CONNECTION_REQUEST: &str = r#"
mutation ($invitedUserId: ID!, $connectionType: B2cConnectionType!) {
  createB2cConnectionRequest(invitedUserId: $invitedUserId, connectionType: $connectionType) {
    id
    status
  }
}"#;

const CREATE_INVITE: &str = r#"
mutation ($user: InviteUserInput!, $connectionType: B2cConnectionType!) {
  createB2cInvite(user: $user, connectionType: $connectionType) {
    id
    invitedUser { id }
  }
}"#;

const PENDING_REQUESTS_QUERY: &str = r#"
query ($invitedUserId: ID) {
  pendingB2cConnectionRequests(invitedUserId: $invitedUserId) { id status }
}"#;

const CONNECTIONS_QUERY: &str = r#"
query {
  b2cConnections { id connectedUser { id } }
}"#;

#[derive(Debug, Clone, Deserialize)]
pub struct TnidUser {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionRequest {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Invite {
    #[serde(rename = "invitedUser")]
    invited_user: TnidUser,
}

#[derive(Debug, Clone, Deserialize)]
struct Connection {
    #[serde(rename = "connectedUser")]
    connected_user: Option<TnidUser>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

pub struct TnidClient {
    http: reqwest::Client,
    api_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<String>>,
}

impl TnidClient {
    pub fn new(config: &VerificationConfig) -> Result<Self, VerificationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, VerificationError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let response = self
            .http
            .post(format!("{}/auth/token", self.api_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(VerificationError::Auth(format!(
                "token endpoint answered {}",
                response.status()
            )));
        }
        let token = response.json::<TokenResponse>().await?.access_token;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, VerificationError> {
        let body = json!({ "query": query, "variables": variables });
        let mut retried = false;
        loop {
            let token = self.access_token().await?;
            let response = self
                .http
                .post(format!("{}/company", self.api_url))
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await?;

            // Tokens expire server-side; fetch a new one once.
            if response.status() == StatusCode::UNAUTHORIZED && !retried {
                retried = true;
                *self.token.lock().await = None;
                continue;
            }
            if !response.status().is_success() {
                return Err(VerificationError::GraphQl(format!(
                    "company API answered {}",
                    response.status()
                )));
            }

            let parsed: GraphQlResponse<T> = response.json().await?;
            if !parsed.errors.is_empty() {
                let messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();
                return Err(VerificationError::GraphQl(messages.join("; ")));
            }
            return parsed
                .data
                .ok_or_else(|| VerificationError::Decode("response without data".into()));
        }
    }

    /// People registered with `telephone_number`.
    pub async fn users(&self, telephone_number: &str) -> Result<Vec<TnidUser>, VerificationError> {
        #[derive(Deserialize)]
        struct Data {
            users: Vec<TnidUser>,
        }
        let data: Data = self
            .graphql(
                USERS_QUERY,
                json!({ "telephoneNumber": telephone_number, "limit": 1 }),
            )
            .await?;
        Ok(data.users)
    }

    pub async fn create_b2c_connection_request(
        &self,
        invited_user_id: &str,
    ) -> Result<ConnectionRequest, VerificationError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "createB2cConnectionRequest")]
            request: ConnectionRequest,
        }
        let data: Data = self
            .graphql(
                CREATE_CONNECTION_REQUEST,
                json!({ "invitedUserId": invited_user_id, "connectionType": CONNECTION_TYPE }),
            )
            .await?;
        Ok(data.request)
    }

    /// Invite someone who has no account yet. Returns their new user id.
    pub async fn create_b2c_invite(
        &self,
        telephone_number: &str,
        email_address: &str,
    ) -> Result<TnidUser, VerificationError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "createB2cInvite")]
            invite: Invite,
        }
        let data: Data = self
            .graphql(
                CREATE_INVITE,
                json!({
                    "user": { "emailAddress": email_address, "telephoneNumber": telephone_number },
                    "connectionType": CONNECTION_TYPE,
                }),
            )
            .await?;
        Ok(data.invite.invited_user)
    }

    pub async fn pending_b2c_connection_requests(
        &self,
        invited_user_id: &str,
    ) -> Result<Vec<ConnectionRequest>, VerificationError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "pendingB2cConnectionRequests")]
            requests: Vec<ConnectionRequest>,
        }
        let data: Data = self
            .graphql(
                PENDING_REQUESTS_QUERY,
                json!({ "invitedUserId": invited_user_id }),
            )
            .await?;
        Ok(data.requests)
    }

    /// Ids of everyone connected to the company.
    pub async fn connected_user_ids(&self) -> Result<Vec<String>, VerificationError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "b2cConnections")]
            connections: Vec<Connection>,
        }
        let data: Data = self.graphql(CONNECTIONS_QUERY, json!({})).await?;
        Ok(data
            .connections
            .into_iter()
            .filter_map(|c| c.connected_user.map(|u| u.id))
            .collect())
    }
}

#[async_trait]
impl IdentityVerifier for TnidClient {
    #[tracing::instrument(skip(self, identity, email), fields(user_id = %identity.user_id))]
    async fn request(
        &self,
        identity: &AuthenticatedIdentity,
        email: Option<&str>,
    ) -> Result<Contact, VerificationError> {
        if let Some(person) = self.users(&identity.username).await?.into_iter().next() {
            let request = self.create_b2c_connection_request(&person.id).await?;
            tracing::info!(request_id = %request.id, tnid_user = %person.id, "Sent connection request");
            return Ok(Contact::Requested {
                network_id: person.id,
            });
        }

        match email {
            Some(email) => {
                let invited = self.create_b2c_invite(&identity.username, email).await?;
                tracing::info!(tnid_user = %invited.id, "Invited new person to the network");
                Ok(Contact::Requested {
                    network_id: invited.id,
                })
            }
            None => {
                tracing::info!("Nobody with this telephone number on the network");
                Ok(Contact::Unreachable)
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn verify(&self, network_id: &str) -> Result<VerificationStatus, VerificationError> {
        if !self
            .pending_b2c_connection_requests(network_id)
            .await?
            .is_empty()
        {
            return Ok(VerificationStatus::Pending);
        }

        let connected = self.connected_user_ids().await?;
        Ok(if connected.iter().any(|id| id == network_id) {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Failed
        })
    }
}
