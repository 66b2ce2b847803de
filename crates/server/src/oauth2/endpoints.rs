//! OAuth2 HTTP endpoints.
//!
//! Implements the OAuth2 authorization server endpoints:
//! - Authorization endpoint (request validation and consent)
//! - Token endpoint
//! - UserInfo

use crate::error::{AuthorizeError, ErrorResponse, OAuth2Error};
use crate::oauth2::bearer::{BearerAuth, SCOPE_PROFILE};
use crate::oauth2::consent::{ConsentAnswer, PendingGrant};
use crate::oauth2::flow::{AuthorizationFlow, AuthorizationRequest, FlowState};
use crate::oauth2::token::{ClientCredentials, TokenRequest, TokenResponse};
use crate::oauth2::{OAUTH2_TAG, state::OAuth2State};
use crate::session::CurrentIdentity;
use axum::{
    Form, Json,
    extract::{OriginalUri, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Creates the OAuth2 router.
pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(authorize, authorize_submit))
        .routes(routes!(token))
        .routes(routes!(userinfo))
        .with_state(state)
}

/// Consent decision submitted by the end-user.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ConsentForm {
    /// `on` approves; anything else denies
    pub confirm: Option<String>,
    /// `on` remembers the approval for later requests
    pub remember: Option<String>,
}

/// Claims returned by the userinfo endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserInfoResponse {
    /// Subject identifier
    pub sub: String,
    pub phone_number: String,
    pub phone_number_verified: bool,
}

/// OAuth2 Authorization endpoint.
#[tracing::instrument(skip(state, identity, uri))]
#[utoipa::path(
    get,
    path = "/authorize",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Authorize",
    summary = "Start an authorization code flow",
    description = "Validates the authorization request against the client's registration.\n\n\
                   - Without a session the browser is sent to `/login` and returns here afterwards.\n\
                   - If the user already approved this client for the requested scope, the browser is \
                     redirected to the client with a `code` straight away (unless `prompt=consent`).\n\
                   - Otherwise the pending grant is returned so the consent question can be shown; \
                     answer it with `POST /oauth/authorize`.\n\n\
                   Unknown clients and unregistered redirect URIs are answered with a JSON error and \
                   never redirected. Other request errors are redirected to the client with \
                   `error`, `error_description` and `state`.",
    params(AuthorizationRequest),
    responses(
        (status = 200, description = "Consent is required for this request", body = PendingGrant),
        (status = 303, description = "Redirect to the login page, or back to the client with a code or an error"),
        (status = 400, description = "Unknown client or untrusted redirect_uri", body = ErrorResponse),
    )
)]
pub async fn authorize(
    State(state): State<OAuth2State>,
    CurrentIdentity(identity): CurrentIdentity,
    OriginalUri(uri): OriginalUri,
    Query(request): Query<AuthorizationRequest>,
) -> Result<Response, AuthorizeError> {
    let Some(identity) = identity else {
        state.consent.validate_request(&request).await?;
        let login_url = format!("/login?return_to={}", urlencoding::encode(&uri.to_string()));
        return Ok(Redirect::to(&login_url).into_response());
    };

    let mut flow = AuthorizationFlow::new(identity, request, state.flow_lifetime);
    flow.validate(&state.consent).await?;

    if flow.await_consent(true)? == FlowState::ConsentGranted {
        let location = flow.issue_code(&state.issuer).await?;
        return Ok(Redirect::to(&location).into_response());
    }

    let pending = flow.pending_grant().cloned().ok_or_else(|| {
        AuthorizeError::Direct(OAuth2Error::Internal(
            "awaiting consent without a pending grant".into(),
        ))
    })?;
    Ok((StatusCode::OK, Json(pending)).into_response())
}

/// Consent submission.
#[tracing::instrument(skip(state, identity, form))]
#[utoipa::path(
    post,
    path = "/authorize",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Authorize Consent",
    summary = "Approve or deny an authorization request",
    description = "Carries the same query parameters as `GET /oauth/authorize`. The request is validated again, \
                   then `confirm=on` approves and any other value denies.\n\n\
                   On approval the browser is redirected to `redirect_uri?code=...&state=...`; on denial to \
                   `redirect_uri?error=access_denied&state=...`. With `remember=on` the approval is stored \
                   and later requests for the same or a narrower scope skip the question.",
    params(AuthorizationRequest),
    request_body(
        content = ConsentForm,
        content_type = "application/x-www-form-urlencoded",
        description = "Consent decision"
    ),
    responses(
        (status = 303, description = "Redirect back to the client with a code or `access_denied`"),
        (status = 400, description = "Unknown client or untrusted redirect_uri", body = ErrorResponse),
        (status = 401, description = "No session", body = ErrorResponse),
    )
)]
pub async fn authorize_submit(
    State(state): State<OAuth2State>,
    CurrentIdentity(identity): CurrentIdentity,
    Query(request): Query<AuthorizationRequest>,
    Form(form): Form<ConsentForm>,
) -> Result<Response, AuthorizeError> {
    let Some(identity) = identity else {
        state.consent.validate_request(&request).await?;
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "login_required".to_string(),
                error_description: Some("Log in before answering a consent request".to_string()),
            }),
        )
            .into_response());
    };

    let mut flow = AuthorizationFlow::new(identity, request, state.flow_lifetime);
    flow.validate(&state.consent).await?;
    flow.await_consent(false)?;
    flow.answer(
        &state.consent,
        ConsentAnswer::from_form(form.confirm.as_deref(), form.remember.as_deref()),
    )
    .await?;
    let location = flow.issue_code(&state.issuer).await?;
    Ok(Redirect::to(&location).into_response())
}

/// OAuth2 Token endpoint.
#[tracing::instrument(skip(state, headers, request))]
#[utoipa::path(
    post,
    path = "/token",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Token",
    summary = "Exchange an authorization code or refresh token for tokens",
    description = "**Supported grant types:**\n\
                   - `authorization_code`: `code` and the `redirect_uri` used at the authorization step\n\
                   - `refresh_token`: `refresh_token`, optionally a narrower `scope`. The presented refresh \
                     token is revoked and a new pair is returned.\n\n\
                   **Client authentication** follows the client's registered `token_endpoint_auth_method`:\n\
                   - `client_secret_basic`: HTTP Basic credentials\n\
                   - `client_secret_post`: `client_id` and `client_secret` in the body\n\
                   - `none`: `client_id` only\n\n\
                   An authorization code can be redeemed once. Presenting it again fails with `invalid_grant` \
                   and revokes the tokens issued from it.",
    request_body(
        content = TokenRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token request parameters"
    ),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid request, grant or scope", body = ErrorResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn token(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Response {
    let result = match ClientCredentials::extract(&headers, &request) {
        Ok(credentials) => state.tokens.exchange(request, credentials).await,
        Err(e) => Err(e),
    };

    let mut response = match result {
        Ok(tokens) => (StatusCode::OK, Json(tokens)).into_response(),
        Err(e) => e.into_response(),
    };
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// UserInfo endpoint.
#[tracing::instrument(skip(state, grant))]
#[utoipa::path(
    get,
    path = "/userinfo",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 UserInfo",
    summary = "Get the token owner's claims",
    description = "Requires a bearer access token carrying the `profile` scope.",
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "User claims", body = UserInfoResponse),
        (status = 401, description = "Missing, unknown, revoked or expired access token", body = ErrorResponse),
        (status = 403, description = "Token lacks the `profile` scope", body = ErrorResponse),
    )
)]
pub async fn userinfo(
    State(state): State<OAuth2State>,
    BearerAuth(grant): BearerAuth,
) -> Result<Json<UserInfoResponse>, OAuth2Error> {
    grant.require_scope(SCOPE_PROFILE)?;

    let user = state
        .find_user(&grant.user_id)
        .await?
        .ok_or_else(|| OAuth2Error::InvalidToken("Token subject no longer exists".into()))?;

    Ok(Json(UserInfoResponse {
        phone_number_verified: user.is_verified(),
        sub: user.id,
        phone_number: user.username,
    }))
}
