//! OAuth2 endpoint tests.
//!
//! Drives the full router against an in-memory SQLite database: client
//! registration, the authorize/consent round trip, the token endpoint and
//! userinfo.

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::{TestResponse, TestServer};
use base64::Engine;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, EntityTrait, Statement};
use std::sync::Arc;
use tnid_oauth_server::{
    AppResources,
    api::build_router,
    config::{AppConfig, OAuth2Config, VerificationConfig},
    entity::oauth2_token,
    oauth2::{AuthenticatedIdentity, mark_user_verified},
    session::{SessionClaims, SessionKind},
};

const REDIRECT_URI: &str = "http://localhost:3000/callback";
const SECRET: &str = "12345678901234567890123456789012";

/// Create a test database with the OAuth2 tables
async fn create_oauth2_test_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.expect("connect");

    for sql in [
        r#"CREATE TABLE oauth2_user (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            verified_at TEXT NULL
        );"#,
        r#"CREATE TABLE oauth2_client (
            id TEXT PRIMARY KEY,
            client_secret TEXT NOT NULL DEFAULT '',
            client_id_issued_at INTEGER NOT NULL,
            user_id TEXT NOT NULL,
            client_metadata TEXT NOT NULL
        );"#,
        r#"CREATE TABLE oauth2_authorization (
            code TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            redirect_uri TEXT NULL,
            scope TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            consumed_at TEXT NULL
        );"#,
        r#"CREATE TABLE oauth2_token (
            id TEXT PRIMARY KEY,
            access_token TEXT NOT NULL UNIQUE,
            refresh_token TEXT UNIQUE,
            token_type TEXT NOT NULL DEFAULT 'Bearer',
            client_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            scope TEXT NOT NULL,
            authorization_code TEXT NULL,
            access_token_expires_at TEXT NOT NULL,
            refresh_token_expires_at TEXT NULL,
            created_at TEXT NOT NULL,
            revoked_at TEXT NULL
        );"#,
        r#"CREATE TABLE oauth2_consent (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            scope TEXT NOT NULL,
            granted_at TEXT NOT NULL,
            UNIQUE (user_id, client_id)
        );"#,
    ] {
        db.execute(Statement::from_string(DbBackend::Sqlite, sql))
            .await
            .expect("create table");
    }

    db
}

fn create_test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        listen_addr: "127.0.0.1:0".into(),
        issuer_url: "http://localhost:8080".into(),
        session_secret: SECRET.into(),
        session_lifetime: 3600,
        oauth2: OAuth2Config::default(),
        verification: VerificationConfig::default(),
    }
}

struct TestApp {
    server: TestServer,
    resources: AppResources,
}

impl TestApp {
    async fn new() -> Self {
        Self::with_config(create_test_config()).await
    }

    async fn with_config(config: AppConfig) -> Self {
        let db = Arc::new(create_oauth2_test_db().await);
        let resources = AppResources::new(db, Arc::new(config), None);
        let server = TestServer::new(build_router(resources.clone())).expect("create test server");
        Self { server, resources }
    }

    /// Create a verified user and a session cookie for them.
    async fn login(&self, username: &str) -> (AuthenticatedIdentity, HeaderValue) {
        let user = self
            .resources
            .oauth2
            .get_or_create_user(username)
            .await
            .expect("create user");
        let user = mark_user_verified(&self.resources.db, &user.id)
            .await
            .expect("verify user")
            .expect("user exists");
        let identity = AuthenticatedIdentity::from(&user);
        let token = SessionClaims::new(&identity, SessionKind::Session, 3600)
            .issue(SECRET)
            .expect("issue session");
        let cookie = HeaderValue::from_str(&format!("session={token}")).expect("cookie");
        (identity, cookie)
    }

    async fn register_client(
        &self,
        cookie: &HeaderValue,
        auth_method: &str,
        grant_types: &str,
    ) -> serde_json::Value {
        let response = self
            .server
            .post("/clients")
            .add_header(header::COOKIE, cookie.clone())
            .form(&[
                ("client_name", "Test Client"),
                ("client_uri", "http://localhost:3000"),
                ("grant_type", grant_types),
                ("redirect_uri", REDIRECT_URI),
                ("response_type", "code"),
                ("scope", "profile email"),
                ("token_endpoint_auth_method", auth_method),
            ])
            .await;
        response.assert_status(StatusCode::CREATED);
        response.json()
    }

    /// Run GET + POST /oauth/authorize with an approving answer and return the code.
    async fn authorize(
        &self,
        cookie: &HeaderValue,
        client_id: &str,
        scope: &str,
        remember: bool,
    ) -> String {
        let pending = self
            .server
            .get("/oauth/authorize")
            .add_header(header::COOKIE, cookie.clone())
            .add_query_param("response_type", "code")
            .add_query_param("client_id", client_id)
            .add_query_param("redirect_uri", REDIRECT_URI)
            .add_query_param("scope", scope)
            .add_query_param("state", "xyz")
            .await;
        pending.assert_status_ok();

        let mut form = vec![("confirm", "on")];
        if remember {
            form.push(("remember", "on"));
        }
        let response = self
            .server
            .post("/oauth/authorize")
            .add_header(header::COOKIE, cookie.clone())
            .add_query_param("response_type", "code")
            .add_query_param("client_id", client_id)
            .add_query_param("redirect_uri", REDIRECT_URI)
            .add_query_param("scope", scope)
            .add_query_param("state", "xyz")
            .form(&form)
            .await;
        response.assert_status_see_other();
        let location = location(&response);
        assert!(location.starts_with(REDIRECT_URI));
        assert_eq!(query_param(&location, "state").as_deref(), Some("xyz"));
        query_param(&location, "code").expect("code in redirect")
    }

    async fn redeem_public(&self, client_id: &str, code: &str) -> TestResponse {
        self.server
            .post("/oauth/token")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", REDIRECT_URI),
                ("client_id", client_id),
            ])
            .await
    }
}

fn location(response: &TestResponse) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .expect("location header")
        .to_string()
}

fn query_param(location: &str, name: &str) -> Option<String> {
    let url = url::Url::parse(location).expect("absolute location");
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn basic_auth(client_id: &str, secret: &str) -> HeaderValue {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{client_id}:{secret}"));
    HeaderValue::from_str(&format!("Basic {encoded}")).expect("basic header")
}

fn bearer(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("Bearer {token}")).expect("bearer header")
}

// =============================================================================
// Client Registration Tests
// =============================================================================

#[tokio::test]
async fn test_register_requires_login() {
    let app = TestApp::new().await;

    let response = app
        .server
        .post("/clients")
        .form(&[("client_name", "Anonymous")])
        .await;

    response.assert_status_unauthorized();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "login_required");
}

#[tokio::test]
async fn test_register_confidential_and_public_clients() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;

    let confidential = app
        .register_client(&cookie, "client_secret_basic", "authorization_code")
        .await;
    assert_eq!(confidential["client_id"].as_str().unwrap().len(), 24);
    assert_eq!(confidential["client_secret"].as_str().unwrap().len(), 48);
    assert_eq!(confidential["redirect_uris"][0], REDIRECT_URI);
    assert_eq!(confidential["scope"], "profile email");

    let public = app
        .register_client(&cookie, "none", "authorization_code")
        .await;
    assert_eq!(public["client_secret"], "");
    assert_ne!(public["client_id"], confidential["client_id"]);

    let listed = app
        .server
        .get("/clients")
        .add_header(header::COOKIE, cookie.clone())
        .await;
    listed.assert_status_ok();
    let clients: Vec<serde_json::Value> = listed.json();
    assert_eq!(clients.len(), 2);
    assert!(clients.iter().all(|c| c.get("client_secret").is_none()));
}

#[tokio::test]
async fn test_register_rejects_invalid_metadata() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;

    let blank_redirects = app
        .server
        .post("/clients")
        .add_header(header::COOKIE, cookie.clone())
        .form(&[
            ("client_name", "Broken"),
            ("grant_type", "authorization_code"),
            ("redirect_uri", "\n  \n"),
            ("response_type", "code"),
            ("token_endpoint_auth_method", "none"),
        ])
        .await;
    blank_redirects.assert_status_bad_request();
    let body: serde_json::Value = blank_redirects.json();
    assert_eq!(body["error"], "invalid_client_metadata");

    let bad_method = app
        .server
        .post("/clients")
        .add_header(header::COOKIE, cookie.clone())
        .form(&[
            ("client_name", "Broken"),
            ("grant_type", "authorization_code"),
            ("redirect_uri", REDIRECT_URI),
            ("response_type", "code"),
            ("token_endpoint_auth_method", "private_key_jwt"),
        ])
        .await;
    bad_method.assert_status_bad_request();

    let fragment = app
        .server
        .post("/clients")
        .add_header(header::COOKIE, cookie.clone())
        .form(&[
            ("client_name", "Broken"),
            ("grant_type", "authorization_code"),
            ("redirect_uri", "http://localhost:3000/cb#frag"),
            ("response_type", "code"),
            ("token_endpoint_auth_method", "none"),
        ])
        .await;
    fragment.assert_status_bad_request();
    let body: serde_json::Value = fragment.json();
    assert_eq!(body["error"], "invalid_redirect_uri");
}

// =============================================================================
// Authorization Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_authorize_without_session_redirects_to_login() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let response = app
        .server
        .get("/oauth/authorize")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .add_query_param("redirect_uri", REDIRECT_URI)
        .await;

    response.assert_status_see_other();
    let location = location(&response);
    assert!(location.starts_with("/login?return_to="));
    assert!(location.contains("%2Foauth%2Fauthorize"));
}

#[tokio::test]
async fn test_authorize_unknown_client_is_not_redirected() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;

    let response = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie)
        .add_query_param("response_type", "code")
        .add_query_param("client_id", "nonexistent-client")
        .add_query_param("redirect_uri", REDIRECT_URI)
        .await;

    response.assert_status_bad_request();
    assert!(response.headers().get(header::LOCATION).is_none());
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_authorize_unregistered_redirect_uri_is_not_redirected() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;

    let response = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie)
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client["client_id"].as_str().unwrap())
        .add_query_param("redirect_uri", "http://evil.example/callback")
        .await;

    response.assert_status_bad_request();
    assert!(response.headers().get(header::LOCATION).is_none());
}

#[tokio::test]
async fn test_authorize_errors_after_redirect_check_are_redirected() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let unsupported = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie.clone())
        .add_query_param("response_type", "token")
        .add_query_param("client_id", client_id)
        .add_query_param("redirect_uri", REDIRECT_URI)
        .add_query_param("state", "s1")
        .await;
    unsupported.assert_status_see_other();
    let error_redirect = location(&unsupported);
    assert_eq!(
        query_param(&error_redirect, "error").as_deref(),
        Some("unsupported_response_type")
    );
    assert_eq!(query_param(&error_redirect, "state").as_deref(), Some("s1"));

    let bad_scope = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie)
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .add_query_param("redirect_uri", REDIRECT_URI)
        .add_query_param("scope", "profile admin")
        .await;
    bad_scope.assert_status_see_other();
    assert_eq!(
        query_param(&location(&bad_scope), "error").as_deref(),
        Some("invalid_scope")
    );
}

#[tokio::test]
async fn test_authorize_describes_pending_grant() {
    let app = TestApp::new().await;
    let (identity, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    // Omitted redirect_uri resolves to the single registered one; omitted
    // scope to the client's registered scope.
    let response = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie)
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["client_id"], client_id);
    assert_eq!(body["client_name"], "Test Client");
    assert_eq!(body["redirect_uri"], REDIRECT_URI);
    assert_eq!(body["scope"], "profile email");
    assert_eq!(body["user"]["user_id"], identity.user_id.as_str());
    assert_eq!(body["previously_approved"], false);
}

#[tokio::test]
async fn test_consent_denied_redirects_access_denied() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;

    let response = app
        .server
        .post("/oauth/authorize")
        .add_header(header::COOKIE, cookie)
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client["client_id"].as_str().unwrap())
        .add_query_param("redirect_uri", REDIRECT_URI)
        .add_query_param("state", "s2")
        .form(&[("confirm", "nope")])
        .await;

    response.assert_status_see_other();
    let location = location(&response);
    assert!(location.starts_with(REDIRECT_URI));
    assert_eq!(query_param(&location, "error").as_deref(), Some("access_denied"));
    assert_eq!(query_param(&location, "state").as_deref(), Some("s2"));
    assert!(query_param(&location, "code").is_none());
}

#[tokio::test]
async fn test_consent_submit_requires_session() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;

    let response = app
        .server
        .post("/oauth/authorize")
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client["client_id"].as_str().unwrap())
        .add_query_param("redirect_uri", REDIRECT_URI)
        .form(&[("confirm", "on")])
        .await;

    response.assert_status_unauthorized();
}

#[tokio::test]
async fn test_remembered_consent_skips_question() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    app.authorize(&cookie, client_id, "profile email", true).await;

    // Same or narrower scope goes straight back to the client.
    let again = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie.clone())
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .add_query_param("redirect_uri", REDIRECT_URI)
        .add_query_param("scope", "profile")
        .await;
    again.assert_status_see_other();
    assert!(query_param(&location(&again), "code").is_some());

    // prompt=consent always asks.
    let forced = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie.clone())
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .add_query_param("redirect_uri", REDIRECT_URI)
        .add_query_param("scope", "profile")
        .add_query_param("prompt", "consent")
        .await;
    forced.assert_status_ok();
}

#[tokio::test]
async fn test_unremembered_consent_asks_again() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    app.authorize(&cookie, client_id, "profile", false).await;

    let again = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie)
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .add_query_param("redirect_uri", REDIRECT_URI)
        .add_query_param("scope", "profile")
        .await;
    again.assert_status_ok();
}

// =============================================================================
// Token Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_token_missing_grant_type() {
    let app = TestApp::new().await;

    let response = app
        .server
        .post("/oauth/token")
        .form(&[("code", "test-code"), ("client_id", "anyone")])
        .await;

    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_token_unknown_client() {
    let app = TestApp::new().await;

    let response = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", "test-code"),
            ("client_id", "nonexistent"),
        ])
        .await;

    response.assert_status_unauthorized();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_client");
}

#[tokio::test]
async fn test_token_unsupported_grant_type() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;

    let response = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "password"),
            ("client_id", client["client_id"].as_str().unwrap()),
        ])
        .await;

    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn test_token_unregistered_grant_type() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;

    let response = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", "whatever"),
            ("client_id", client["client_id"].as_str().unwrap()),
        ])
        .await;

    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "unauthorized_client");
}

#[tokio::test]
async fn test_full_code_flow_and_userinfo() {
    let app = TestApp::new().await;
    let (identity, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let code = app.authorize(&cookie, client_id, "profile", false).await;
    let response = app.redeem_public(client_id, &code).await;

    response.assert_status_ok();
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    let tokens: serde_json::Value = response.json();
    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["scope"], "profile");
    assert_eq!(tokens["expires_in"], 3600);
    // No refresh_token grant registered
    assert!(tokens.get("refresh_token").is_none());

    let userinfo = app
        .server
        .get("/oauth/userinfo")
        .add_header(
            header::AUTHORIZATION,
            bearer(tokens["access_token"].as_str().unwrap()),
        )
        .await;
    userinfo.assert_status_ok();
    let body: serde_json::Value = userinfo.json();
    assert_eq!(body["sub"], identity.user_id.as_str());
    assert_eq!(body["phone_number"], "+15550001");
    assert_eq!(body["phone_number_verified"], true);
}

#[tokio::test]
async fn test_code_replay_revokes_issued_tokens() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let code = app.authorize(&cookie, client_id, "profile", false).await;
    let first = app.redeem_public(client_id, &code).await;
    first.assert_status_ok();
    let tokens: serde_json::Value = first.json();
    let access_token = tokens["access_token"].as_str().unwrap();

    let replay = app.redeem_public(client_id, &code).await;
    replay.assert_status_bad_request();
    let body: serde_json::Value = replay.json();
    assert_eq!(body["error"], "invalid_grant");

    // The token minted from the replayed code no longer works.
    let userinfo = app
        .server
        .get("/oauth/userinfo")
        .add_header(header::AUTHORIZATION, bearer(access_token))
        .await;
    userinfo.assert_status_unauthorized();
    let body: serde_json::Value = userinfo.json();
    assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn test_concurrent_redemption_yields_one_token() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let code = app.authorize(&cookie, client_id, "profile", false).await;
    let (a, b) = tokio::join!(
        async { app.redeem_public(client_id, &code).await },
        async { app.redeem_public(client_id, &code).await },
    );

    let statuses = [a.status_code().as_u16(), b.status_code().as_u16()];
    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == 400).count(), 1);

    let tokens = oauth2_token::Entity::find()
        .all(app.resources.db.as_ref())
        .await
        .unwrap();
    assert_eq!(tokens.len(), 1);
    // The losing request counts as a replay.
    assert!(tokens[0].is_revoked());
}

#[tokio::test]
async fn test_redirect_uri_must_match_at_redemption() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let code = app.authorize(&cookie, client_id, "profile", false).await;
    let missing = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", client_id),
        ])
        .await;
    missing.assert_status_bad_request();
    let body: serde_json::Value = missing.json();
    assert_eq!(body["error"], "invalid_grant");

    let wrong = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", "http://localhost:3000/other"),
            ("client_id", client_id),
        ])
        .await;
    wrong.assert_status_bad_request();

    // Neither failure consumed the code.
    app.redeem_public(client_id, &code).await.assert_status_ok();
}

#[tokio::test]
async fn test_code_for_default_redirect_uri_redeems_without_it() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let response = app
        .server
        .post("/oauth/authorize")
        .add_header(header::COOKIE, cookie)
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .add_query_param("scope", "profile")
        .form(&[("confirm", "on")])
        .await;
    response.assert_status_see_other();
    let redirect = location(&response);
    assert!(redirect.starts_with(REDIRECT_URI));
    let code = query_param(&redirect, "code").expect("code in redirect");

    let redeemed = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", client_id),
        ])
        .await;

    redeemed.assert_status_ok();
    let body: serde_json::Value = redeemed.json();
    assert!(body["access_token"].is_string());
}

#[tokio::test]
async fn test_code_bound_to_client() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let first = app.register_client(&cookie, "none", "authorization_code").await;
    let second = app.register_client(&cookie, "none", "authorization_code").await;

    let code = app
        .authorize(&cookie, first["client_id"].as_str().unwrap(), "profile", false)
        .await;
    let response = app
        .redeem_public(second["client_id"].as_str().unwrap(), &code)
        .await;

    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_client_secret_basic_authentication() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app
        .register_client(&cookie, "client_secret_basic", "authorization_code")
        .await;
    let client_id = client["client_id"].as_str().unwrap();
    let secret = client["client_secret"].as_str().unwrap();

    let code = app.authorize(&cookie, client_id, "profile", false).await;

    // Secret in the body is the wrong method for this client.
    let post = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", client_id),
            ("client_secret", secret),
        ])
        .await;
    post.assert_status_unauthorized();

    let wrong = app
        .server
        .post("/oauth/token")
        .add_header(header::AUTHORIZATION, basic_auth(client_id, "wrong"))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
        ])
        .await;
    wrong.assert_status_unauthorized();
    assert_eq!(
        wrong.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic"
    );

    let ok = app
        .server
        .post("/oauth/token")
        .add_header(header::AUTHORIZATION, basic_auth(client_id, secret))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
        ])
        .await;
    ok.assert_status_ok();
}

#[tokio::test]
async fn test_client_secret_post_authentication() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app
        .register_client(&cookie, "client_secret_post", "authorization_code")
        .await;
    let client_id = client["client_id"].as_str().unwrap();
    let secret = client["client_secret"].as_str().unwrap();

    let code = app.authorize(&cookie, client_id, "profile", false).await;

    // No secret at all.
    app.redeem_public(client_id, &code)
        .await
        .assert_status_unauthorized();

    let ok = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", client_id),
            ("client_secret", secret),
        ])
        .await;
    ok.assert_status_ok();
}

#[tokio::test]
async fn test_refresh_token_rotation() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app
        .register_client(&cookie, "none", "authorization_code\nrefresh_token")
        .await;
    let client_id = client["client_id"].as_str().unwrap();

    let code = app
        .authorize(&cookie, client_id, "profile email", false)
        .await;
    let first: serde_json::Value = app.redeem_public(client_id, &code).await.json();
    let refresh_token = first["refresh_token"].as_str().expect("refresh token");

    let rotated = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", "profile"),
            ("client_id", client_id),
        ])
        .await;
    rotated.assert_status_ok();
    let second: serde_json::Value = rotated.json();
    assert_eq!(second["scope"], "profile");
    assert_ne!(second["refresh_token"], first["refresh_token"]);

    // The old pair is revoked.
    let reused = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ])
        .await;
    reused.assert_status_bad_request();
    let body: serde_json::Value = reused.json();
    assert_eq!(body["error"], "invalid_grant");

    // Widening the scope on refresh is refused.
    let widened = app
        .server
        .post("/oauth/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", second["refresh_token"].as_str().unwrap()),
            ("scope", "profile email"),
            ("client_id", client_id),
        ])
        .await;
    widened.assert_status_bad_request();
    let body: serde_json::Value = widened.json();
    assert_eq!(body["error"], "invalid_scope");
}

// =============================================================================
// UserInfo Tests
// =============================================================================

#[tokio::test]
async fn test_userinfo_without_token() {
    let app = TestApp::new().await;

    let response = app.server.get("/oauth/userinfo").await;

    response.assert_status_unauthorized();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn test_userinfo_requires_profile_scope() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let code = app.authorize(&cookie, client_id, "email", false).await;
    let tokens: serde_json::Value = app.redeem_public(client_id, &code).await.json();

    let response = app
        .server
        .get("/oauth/userinfo")
        .add_header(
            header::AUTHORIZATION,
            bearer(tokens["access_token"].as_str().unwrap()),
        )
        .await;
    response.assert_status_forbidden();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "insufficient_scope");
}

// =============================================================================
// Login Tests
// =============================================================================

#[tokio::test]
async fn test_login_without_verification_sets_session() {
    let app = TestApp::new().await;

    let response = app
        .server
        .post("/login")
        .form(&[("username", " +15550002 "), ("return_to", "/oauth/authorize?x=1")])
        .await;

    response.assert_status_see_other();
    assert_eq!(location(&response), "/oauth/authorize?x=1");
    let cookies: Vec<_> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    assert!(cookies.iter().any(|c| c.starts_with("session=") && !c.starts_with("session=;")));
}

#[tokio::test]
async fn test_login_rejects_blank_username() {
    let app = TestApp::new().await;

    let response = app.server.post("/login").form(&[("username", "   ")]).await;

    response.assert_status_bad_request();
}

#[tokio::test]
async fn test_login_ignores_offsite_return_to() {
    let app = TestApp::new().await;

    let response = app
        .server
        .post("/login")
        .form(&[("username", "+15550002"), ("return_to", "https://evil.example")])
        .await;

    response.assert_status_see_other();
    assert_eq!(location(&response), "/");
}

#[tokio::test]
async fn test_logout_removes_session_cookie() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;

    let response = app
        .server
        .get("/logout")
        .add_header(header::COOKIE, cookie)
        .await;

    response.assert_status_see_other();
    assert_eq!(location(&response), "/");
    let cookies: Vec<_> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    assert!(
        cookies
            .iter()
            .any(|c| c.starts_with("session=;") && c.contains("Max-Age=0"))
    );
}

#[tokio::test]
async fn test_api_docs_advertise_issuer_url() {
    let app = TestApp::new().await;

    let response = app.server.get("/api-docs").await;

    response.assert_status_ok();
    assert!(response.text().contains("http://localhost:8080"));
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new().await;
    let response = app.server.get("/healthz").await;
    response.assert_status_ok();
    response.assert_text("ok");
}

#[tokio::test]
async fn test_remember_disabled_always_asks() {
    let mut config = create_test_config();
    config.oauth2.remember_consent = false;
    let app = TestApp::with_config(config).await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    app.authorize(&cookie, client_id, "profile", true).await;

    let again = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie)
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .add_query_param("redirect_uri", REDIRECT_URI)
        .add_query_param("scope", "profile")
        .await;
    again.assert_status_ok();
}

#[tokio::test]
async fn test_denial_is_never_remembered() {
    let app = TestApp::new().await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let denied = app
        .server
        .post("/oauth/authorize")
        .add_header(header::COOKIE, cookie.clone())
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .add_query_param("redirect_uri", REDIRECT_URI)
        .add_query_param("scope", "profile")
        .form(&[("remember", "on")])
        .await;
    denied.assert_status_see_other();
    assert_eq!(
        query_param(&location(&denied), "error").as_deref(),
        Some("access_denied")
    );

    let again = app
        .server
        .get("/oauth/authorize")
        .add_header(header::COOKIE, cookie)
        .add_query_param("response_type", "code")
        .add_query_param("client_id", client_id)
        .add_query_param("redirect_uri", REDIRECT_URI)
        .add_query_param("scope", "profile")
        .await;
    again.assert_status_ok();
    let body: serde_json::Value = again.json();
    assert_eq!(body["previously_approved"], false);
}

#[tokio::test]
async fn test_expired_code_is_rejected() {
    let mut config = create_test_config();
    // Codes are born expired.
    config.oauth2.authorization_code_lifetime = -1;
    let app = TestApp::with_config(config).await;
    let (_, cookie) = app.login("+15550001").await;
    let client = app.register_client(&cookie, "none", "authorization_code").await;
    let client_id = client["client_id"].as_str().unwrap();

    let code = app.authorize(&cookie, client_id, "profile", false).await;
    let response = app.redeem_public(client_id, &code).await;

    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_grant");
    assert_eq!(body["error_description"], "Authorization code expired");
}
