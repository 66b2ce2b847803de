//! Authorization-code grant state machine.
//!
//! One [`AuthorizationFlow`] drives a single authorize request from receipt to
//! an issued code:
//!
//! ```text
//! RequestReceived -> Validated -> AwaitingConsent -> ConsentGranted -> CodeIssued -> Exchanged
//!                          \            |                 ^
//!                           \           +-> ConsentDenied -> Rejected
//!                            +-> ConsentGranted (remembered approval)
//! ```
//!
//! Any non-terminal state becomes `Expired` once the flow lifetime elapses.
//! `Exchanged` is reached by the token endpoint on the persisted code, which
//! reports its own state through `oauth2_authorization::Model::state`.

use crate::error::{AuthorizeError, OAuth2Error};
use crate::oauth2::consent::{
    ApprovedGrant, Consent, ConsentAnswer, ConsentCoordinator, PendingGrant,
};
use crate::oauth2::credentials::CredentialIssuer;
use crate::oauth2::identity::AuthenticatedIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime};
use utoipa::{IntoParams, ToSchema};

/// Authorization request parameters (RFC 6749 section 4.1.1).
///
/// Everything is optional here so that missing parameters surface as OAuth2
/// errors rather than extractor rejections.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizationRequest {
    /// Must be `code`
    pub response_type: Option<String>,
    /// Client identifier issued at registration
    pub client_id: Option<String>,
    /// Must exactly match a registered URI. May be omitted when the client
    /// registered exactly one.
    pub redirect_uri: Option<String>,
    /// Space-separated scopes, defaults to the client's registered scope
    pub scope: Option<String>,
    /// Opaque value echoed back to the client
    pub state: Option<String>,
    /// `consent` forces the consent prompt even if an approval is remembered
    pub prompt: Option<String>,
}

impl AuthorizationRequest {
    pub fn forces_consent(&self) -> bool {
        self.prompt
            .as_deref()
            .is_some_and(|p| p.split_whitespace().any(|v| v == "consent"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    RequestReceived,
    Validated,
    AwaitingConsent,
    ConsentGranted,
    ConsentDenied,
    CodeIssued,
    Exchanged,
    Rejected,
    Expired,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exchanged | Self::Rejected | Self::Expired)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct AuthorizationFlow {
    identity: AuthenticatedIdentity,
    request: AuthorizationRequest,
    state: FlowState,
    started_at: OffsetDateTime,
    lifetime: Duration,
    pending: Option<PendingGrant>,
    approved: Option<ApprovedGrant>,
}

impl AuthorizationFlow {
    pub fn new(
        identity: AuthenticatedIdentity,
        request: AuthorizationRequest,
        lifetime: Duration,
    ) -> Self {
        Self {
            identity,
            request,
            state: FlowState::RequestReceived,
            started_at: OffsetDateTime::now_utc(),
            lifetime,
            pending: None,
            approved: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn pending_grant(&self) -> Option<&PendingGrant> {
        self.pending.as_ref()
    }

    /// `RequestReceived -> Validated`, or `Rejected` if the request is invalid.
    pub async fn validate(
        &mut self,
        coordinator: &ConsentCoordinator,
    ) -> Result<&PendingGrant, AuthorizeError> {
        self.enter(FlowState::RequestReceived, "validate")?;
        match coordinator
            .get_consent_grant(&self.identity, &self.request)
            .await
        {
            Ok(pending) => {
                self.state = FlowState::Validated;
                Ok(self.pending.insert(pending))
            }
            Err(e) => {
                tracing::debug!(error = %e, "Authorization request rejected");
                self.state = FlowState::Rejected;
                Err(e)
            }
        }
    }

    /// `Validated -> AwaitingConsent`, or straight to `ConsentGranted` when a
    /// remembered approval covers the request and `allow_remembered` is set.
    pub fn await_consent(&mut self, allow_remembered: bool) -> Result<FlowState, AuthorizeError> {
        self.enter(FlowState::Validated, "await consent")?;
        let pending = self.require_pending()?;
        if allow_remembered && pending.previously_approved {
            self.approved = Some(pending.approve());
            self.state = FlowState::ConsentGranted;
        } else {
            self.state = FlowState::AwaitingConsent;
        }
        Ok(self.state)
    }

    /// `AwaitingConsent -> ConsentGranted`, or `ConsentDenied -> Rejected`
    /// with `access_denied` sent back to the client.
    pub async fn answer(
        &mut self,
        coordinator: &ConsentCoordinator,
        answer: ConsentAnswer,
    ) -> Result<FlowState, AuthorizeError> {
        self.enter(FlowState::AwaitingConsent, "answer consent")?;
        let pending = self.require_pending()?.clone();

        match coordinator.resolve(&pending, answer).await {
            Consent::Approved(grant) => {
                self.approved = Some(grant);
                self.state = FlowState::ConsentGranted;
                Ok(self.state)
            }
            Consent::Denied => {
                self.state = FlowState::ConsentDenied;
                tracing::debug!(client_id = %pending.client_id, state = %self.state, "Rejecting denied authorization");
                self.state = FlowState::Rejected;
                Err(AuthorizeError::redirect(
                    OAuth2Error::AccessDenied,
                    &pending.redirect_uri,
                    pending.state.as_deref(),
                ))
            }
            Consent::Error(error) => {
                self.state = FlowState::Rejected;
                Err(AuthorizeError::redirect(
                    error,
                    &pending.redirect_uri,
                    pending.state.as_deref(),
                ))
            }
        }
    }

    /// `ConsentGranted -> CodeIssued`. Returns the URL to send the user-agent
    /// back to.
    #[tracing::instrument(skip_all, fields(client_id = ?self.request.client_id, user_id = %self.identity.user_id))]
    pub async fn issue_code(&mut self, issuer: &CredentialIssuer) -> Result<String, AuthorizeError> {
        self.enter(FlowState::ConsentGranted, "issue code")?;
        let grant = self.approved.clone().ok_or_else(|| {
            AuthorizeError::Direct(OAuth2Error::Internal(
                "consent granted without an approved grant".into(),
            ))
        })?;

        let code = match issuer.new_authorization_code(&grant).await {
            Ok(code) => code,
            Err(e) => {
                self.state = FlowState::Rejected;
                return Err(AuthorizeError::redirect(
                    OAuth2Error::Database(e),
                    &grant.redirect_uri,
                    grant.state.as_deref(),
                ));
            }
        };

        self.state = FlowState::CodeIssued;
        tracing::info!(scope = %grant.scope, "Issued authorization code");
        Ok(success_redirect(
            &grant.redirect_uri,
            &code.code,
            grant.state.as_deref(),
        ))
    }

    /// Check the flow may move out of `expected`, expiring it if its lifetime
    /// has elapsed.
    fn enter(&mut self, expected: FlowState, action: &str) -> Result<(), AuthorizeError> {
        if !self.state.is_terminal() && OffsetDateTime::now_utc() - self.started_at >= self.lifetime
        {
            self.state = FlowState::Expired;
            let error = OAuth2Error::InvalidRequest("Authorization request expired".into());
            return Err(match &self.pending {
                Some(pending) => AuthorizeError::redirect(
                    error,
                    &pending.redirect_uri,
                    pending.state.as_deref(),
                ),
                None => AuthorizeError::Direct(error),
            });
        }

        if self.state != expected {
            return Err(AuthorizeError::Direct(OAuth2Error::InvalidRequest(format!(
                "Cannot {action} while the authorization flow is {}",
                self.state
            ))));
        }
        Ok(())
    }

    fn require_pending(&self) -> Result<&PendingGrant, AuthorizeError> {
        self.pending.as_ref().ok_or_else(|| {
            AuthorizeError::Direct(OAuth2Error::Internal(
                "validated flow without a pending grant".into(),
            ))
        })
    }
}

/// `redirect_uri` with `code` and `state` appended, preserving any query the
/// client registered.
pub fn success_redirect(redirect_uri: &str, code: &str, state: Option<&str>) -> String {
    match url::Url::parse(redirect_uri) {
        Ok(mut url) => {
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("code", code);
                if let Some(s) = state.filter(|s| !s.is_empty()) {
                    pairs.append_pair("state", s);
                }
            }
            url.into()
        }
        // Registered URIs are validated as absolute at registration time.
        Err(_) => {
            let separator = if redirect_uri.contains('?') { '&' } else { '?' };
            let mut out = format!(
                "{redirect_uri}{separator}code={}",
                urlencoding::encode(code)
            );
            if let Some(s) = state.filter(|s| !s.is_empty()) {
                out.push_str(&format!("&state={}", urlencoding::encode(s)));
            }
            out
        }
    }
}
