//! End-user login endpoints.
//!
//! Logging in creates the user on first sight. When identity verification is
//! enabled the login only completes once the network confirms the user; the
//! browser polls `/login/status` in the meantime.

use crate::AppResources;
use crate::error::{ErrorResponse, OAuth2Error};
use crate::oauth2::identity::{AuthenticatedIdentity, normalize_username};
use crate::oauth2::{ACCOUNT_TAG, mark_user_verified, state::OAuth2State};
use crate::session::{
    self, SessionClaims, SessionKind, removal_cookie, sanitize_return_to, token_cookie,
};
use crate::verification::VerificationStatus;
use axum::{
    Extension, Form, Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

/// Extra time a pending login cookie outlives the verification attempt.
const PENDING_LOGIN_GRACE_SECS: i64 = 60;

/// Creates the login router.
pub fn router() -> OpenApiRouter<OAuth2State> {
    OpenApiRouter::new()
        .routes(routes!(login_page, login_submit))
        .routes(routes!(login_status))
        .routes(routes!(logout))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LoginQuery {
    /// Relative path to return to after login
    pub return_to: Option<String>,
}

/// What the login form needs to know.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginPrompt {
    pub return_to: String,
    /// Whether login waits for the identity network
    pub verification_enabled: bool,
}

/// Form data for login submission.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginForm {
    /// Phone-number-like handle
    pub username: String,
    /// Relative path to return to after login
    pub return_to: Option<String>,
    /// Used to invite people who are not on the identity network yet
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginStatusResponse {
    pub status: VerificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
}

/// Describe the login form.
#[tracing::instrument(skip(resources))]
#[utoipa::path(
    get,
    path = "/login",
    tag = ACCOUNT_TAG,
    operation_id = "Login Page",
    summary = "Describe the login form",
    description = "Target of the authorization endpoint's login redirect. Submit the form with `POST /login`.",
    params(LoginQuery),
    responses(
        (status = 200, description = "Login form parameters", body = LoginPrompt),
    )
)]
pub async fn login_page(
    Extension(resources): Extension<AppResources>,
    Query(query): Query<LoginQuery>,
) -> Json<LoginPrompt> {
    Json(LoginPrompt {
        return_to: sanitize_return_to(query.return_to.as_deref()),
        verification_enabled: resources.verifier.is_some(),
    })
}

/// Handle login form submission.
#[tracing::instrument(skip(state, resources, jar, form))]
#[utoipa::path(
    post,
    path = "/login",
    tag = ACCOUNT_TAG,
    operation_id = "Login",
    summary = "Log in with a phone number",
    description = "Finds or creates the user named by `username`.\n\n\
                   - Without identity verification the session cookie is set and the browser is \
                     redirected to `return_to`.\n\
                   - With identity verification a connection request is sent to the user's phone and \
                     `202 {\"status\":\"pending\"}` is returned; poll `GET /login/status` until it \
                     reports `verified` or `failed`.",
    request_body(
        content = LoginForm,
        content_type = "application/x-www-form-urlencoded",
        description = "Login credentials"
    ),
    responses(
        (status = 202, description = "Verification started", body = LoginStatusResponse),
        (status = 303, description = "Logged in, redirect to `return_to`"),
        (status = 400, description = "Invalid username", body = ErrorResponse),
    )
)]
pub async fn login_submit(
    State(state): State<OAuth2State>,
    Extension(resources): Extension<AppResources>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response, OAuth2Error> {
    let username = normalize_username(&form.username).ok_or_else(|| {
        OAuth2Error::InvalidRequest("username must be a phone number without spaces".into())
    })?;
    let return_to = sanitize_return_to(form.return_to.as_deref());
    let user = state.get_or_create_user(&username).await?;

    let Some(verifier) = resources.verifier.clone() else {
        let user = mark_user_verified(&state.db, &user.id).await?.unwrap_or(user);
        tracing::info!(user_id = %user.id, "User logged in");
        let jar = start_session(jar, &resources, &AuthenticatedIdentity::from(&user))?;
        return Ok((jar, Redirect::to(&return_to)).into_response());
    };

    let identity = AuthenticatedIdentity::from(&user);
    let attempt = resources
        .verification_tasks
        .start_or_restart(
            state.db.clone(),
            verifier,
            identity.clone(),
            form.email.filter(|e| !e.trim().is_empty()),
        )
        .await;

    let lifetime = resources.config.verification.timeout_secs as i64 + PENDING_LOGIN_GRACE_SECS;
    let pending = SessionClaims::new(&identity, SessionKind::PendingLogin, lifetime)
        .with_return_to(return_to)
        .with_attempt(attempt)
        .issue(&resources.config.session_secret)
        .map_err(|e| OAuth2Error::Internal(e.to_string()))?;

    tracing::info!(user_id = %user.id, "Login waiting for identity verification");
    Ok((
        StatusCode::ACCEPTED,
        jar.add(token_cookie(SessionKind::PendingLogin, pending, lifetime)),
        Json(LoginStatusResponse {
            status: VerificationStatus::Pending,
            return_to: None,
        }),
    )
        .into_response())
}

/// Poll a pending login.
#[tracing::instrument(skip(state, resources, jar))]
#[utoipa::path(
    get,
    path = "/login/status",
    tag = ACCOUNT_TAG,
    operation_id = "Login Status",
    summary = "Check whether identity verification finished",
    description = "Reads the `pending_login` cookie set by `POST /login`. Once the identity network \
                   confirmed the user the session cookie is set and `return_to` is reported.",
    responses(
        (status = 200, description = "Verified and logged in", body = LoginStatusResponse),
        (status = 202, description = "Still waiting for the user", body = LoginStatusResponse),
        (status = 401, description = "No pending login", body = ErrorResponse),
        (status = 403, description = "Verification failed or timed out", body = LoginStatusResponse),
    )
)]
pub async fn login_status(
    State(state): State<OAuth2State>,
    Extension(resources): Extension<AppResources>,
    jar: CookieJar,
) -> Result<Response, OAuth2Error> {
    let secret = &resources.config.session_secret;
    let claims = match session::from_jar(&jar, secret, SessionKind::PendingLogin) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!(error = %e, "No usable pending login");
            return Ok((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "login_required".to_string(),
                    error_description: Some("No pending login".to_string()),
                }),
            )
                .into_response());
        }
    };

    let status = match claims.attempt.as_deref() {
        Some(attempt) => resources
            .verification_tasks
            .status(&claims.sub, attempt)
            .await
            .unwrap_or(VerificationStatus::Failed),
        None => VerificationStatus::Failed,
    };

    match status {
        VerificationStatus::Pending => Ok((
            StatusCode::ACCEPTED,
            Json(LoginStatusResponse {
                status,
                return_to: None,
            }),
        )
            .into_response()),
        VerificationStatus::Failed => Ok((
            StatusCode::FORBIDDEN,
            jar.remove(removal_cookie(SessionKind::PendingLogin)),
            Json(LoginStatusResponse {
                status,
                return_to: None,
            }),
        )
            .into_response()),
        VerificationStatus::Verified => {
            let user = state
                .find_user(&claims.sub)
                .await?
                .ok_or_else(|| OAuth2Error::Internal("verified user vanished".into()))?;
            let return_to = sanitize_return_to(claims.return_to.as_deref());
            let jar = start_session(jar, &resources, &AuthenticatedIdentity::from(&user))?;
            tracing::info!(user_id = %user.id, "User logged in after verification");
            Ok((
                StatusCode::OK,
                jar,
                Json(LoginStatusResponse {
                    status,
                    return_to: Some(return_to),
                }),
            )
                .into_response())
        }
    }
}

/// End the session.
#[tracing::instrument(skip(jar))]
#[utoipa::path(
    get,
    path = "/logout",
    tag = ACCOUNT_TAG,
    operation_id = "Logout",
    summary = "Log out",
    description = "Clears the session cookie and redirects to `/`.",
    responses(
        (status = 303, description = "Logged out"),
    )
)]
pub async fn logout(jar: CookieJar) -> (CookieJar, Redirect) {
    let jar = jar
        .remove(removal_cookie(SessionKind::Session))
        .remove(removal_cookie(SessionKind::PendingLogin));
    (jar, Redirect::to("/"))
}

/// Set the session cookie for `identity` and drop any pending login.
fn start_session(
    jar: CookieJar,
    resources: &AppResources,
    identity: &AuthenticatedIdentity,
) -> Result<CookieJar, OAuth2Error> {
    let lifetime = resources.config.session_lifetime;
    let token = SessionClaims::new(identity, SessionKind::Session, lifetime)
        .issue(&resources.config.session_secret)
        .map_err(|e| OAuth2Error::Internal(e.to_string()))?;
    Ok(jar
        .add(token_cookie(SessionKind::Session, token, lifetime))
        .remove(removal_cookie(SessionKind::PendingLogin)))
}
