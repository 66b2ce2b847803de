//! API module wiring the HTTP surface together.
//!
//! - `/oauth/*` - Authorization server endpoints
//! - `/clients`, `/login`, `/logout` - Client management and end-user session
//! - `health` - Health check endpoint (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration, rendered at /api-docs

pub mod health;
pub mod openapi;

use crate::AppResources;
use crate::oauth2;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa::openapi::Server;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Build the application router with all routes and middleware.
pub fn build_router(app_resources: AppResources) -> axum::Router {
    let oauth2_state = app_resources.oauth2.clone();
    let issuer_url = app_resources.config.issuer_url.clone();
    let (router, mut api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .nest("/oauth", oauth2::router(oauth2_state.clone()))
        .merge(oauth2::account_router(oauth2_state))
        .routes(routes!(health::health))
        // Attach application resources, CORS and the standard TraceLayer.
        .layer(axum::Extension(app_resources))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    // Public base URL, as clients should address it.
    api.servers = Some(vec![Server::new(issuer_url)]);
    router.merge(Redoc::with_url("/api-docs", api))
}

/// Starts the web server with all configured routes.
#[tracing::instrument(skip(app_resources))]
pub async fn start_webserver(app_resources: AppResources) -> color_eyre::Result<()> {
    let addr = app_resources.config.listen_addr.clone();
    let router = build_router(app_resources);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Server running");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
