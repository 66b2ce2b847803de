//! Identity verification against an external identity network.
//!
//! Login can be gated on the user accepting a connection request from this
//! service on their phone. The network is reached through the
//! [`IdentityVerifier`] capability so the poll loop and the HTTP layer never
//! depend on a concrete client.

pub mod task;
pub mod tnid;

pub use task::{PollSettings, VerificationTaskManager};
pub use tnid::TnidClient;

use crate::error::VerificationError;
use crate::oauth2::identity::AuthenticatedIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Pending,
    Failed,
}

impl VerificationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// What happened when the network was asked to contact a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contact {
    /// The person behind `network_id` was asked to confirm. Invited people
    /// keep the id they were invited under until they register.
    Requested { network_id: String },
    /// Nobody on the network could be contacted.
    Unreachable,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Ask the network to confirm `identity`, inviting them by `email` when
    /// they are not on the network yet.
    async fn request(
        &self,
        identity: &AuthenticatedIdentity,
        email: Option<&str>,
    ) -> Result<Contact, VerificationError>;

    /// Current answer from the person contacted by an earlier request.
    async fn verify(&self, network_id: &str) -> Result<VerificationStatus, VerificationError>;
}
