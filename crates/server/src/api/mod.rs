//! HTTP transport for the gateway.
//!
//! This module is organized into submodules:
//! - `auth` - Bearer extraction and the shared JSON error body
//! - `session` - First-party session endpoints (/auth/*)
//! - `internal` - Service-to-service queries (/internal/*)
//! - `health` - Health check endpoint (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration
//!
//! OAuth2 endpoints live in [`crate::oauth2::endpoints`].

pub mod auth;
pub mod health;
pub mod internal;
pub mod openapi;
pub mod session;

pub use health::MISC_TAG;

use crate::AppResources;
use crate::oauth2;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Build the full application router with docs at `/api-docs`.
pub fn app(resources: AppResources) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .nest("/oauth2", oauth2::router())
        .nest("/.well-known", oauth2::well_known_router())
        .nest("/auth", session::router())
        .nest("/internal", internal::router())
        .routes(routes!(health::health))
        .layer(axum::Extension(resources))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

/// Starts the web server with all configured routes.
#[tracing::instrument(skip(resources, shutdown))]
pub async fn start_webserver(
    resources: AppResources,
    shutdown: tokio_util::sync::CancellationToken,
) -> color_eyre::Result<()> {
    let addr = resources.config.listen_addr.clone();
    let router = app(resources);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Server running");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
