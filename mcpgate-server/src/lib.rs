// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

pub mod api;
pub mod auth;
pub mod config;
pub mod control_plane;
pub mod gateway;
pub mod transport;

use anyhow::{Context, Result};
use axum::{middleware as axum_middleware, routing::get, Extension, Router};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{health_check, AppState};
use auth::{auth_middleware, ApiKeyAuth, Authenticator, BearerTokenAuth, MultiAuth, NoAuth};
use config::ServerConfig;
use control_plane::ws_control;
use gateway::Gateway;
use transport::HttpTransport;

/// User every unauthenticated socket runs as when auth is disabled.
const LOCAL_USER_ID: &str = "local";

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mcpgate_server=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    // try_init: tests and embedders may already have a subscriber installed
    let _ = if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
}

/// Picks the authentication strategy from config.
pub fn build_authenticator(config: &ServerConfig) -> Result<Arc<dyn Authenticator>> {
    if !config.auth.enabled {
        tracing::warn!("Authentication is DISABLED; all sockets run as user '{}'", LOCAL_USER_ID);
        return Ok(Arc::new(NoAuth::new(LOCAL_USER_ID)));
    }

    tracing::info!("Authentication enabled");
    let mut strategies: Vec<Arc<dyn Authenticator>> = vec![];

    if let Some(jwt_secret) = config.auth.jwt_secret.clone() {
        tracing::info!("JWT authentication enabled");
        strategies.push(Arc::new(BearerTokenAuth::new(jwt_secret)));
    }

    if !config.auth.api_keys.is_empty() {
        tracing::info!(
            "API key authentication enabled ({} keys)",
            config.auth.api_keys.len()
        );
        strategies.push(Arc::new(ApiKeyAuth::new(config.auth.api_keys.clone())));
    }

    if strategies.is_empty() {
        anyhow::bail!("Authentication enabled but no strategies configured");
    }

    Ok(Arc::new(MultiAuth::new(strategies)))
}

/// Builds the HTTP application: public `/health`, authenticated `/ws`.
pub fn build_router(state: AppState, authenticator: Arc<dyn Authenticator>) -> Router {
    let server = &state.config.server;
    let cors = if server.enable_cors {
        let origins = match server.allowed_origins() {
            Ok(None) => {
                tracing::warn!("CORS: Allowing all origins (development mode). Set cors_origins in production!");
                AllowOrigin::any()
            }
            Ok(Some(origins)) => {
                tracing::info!("CORS: Allowing origins: {:?}", server.cors_origins);
                AllowOrigin::list(origins)
            }
            Err(err) => {
                tracing::error!("CORS: {:#}, no cross-origin requests will be allowed", err);
                AllowOrigin::list(Vec::new())
            }
        };
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    let authed_routes = Router::new()
        .route("/ws", get(ws_control))
        .layer(axum_middleware::from_fn(auth_middleware))
        .layer(Extension(authenticator));

    Router::new()
        .route("/health", get(health_check))
        .merge(authed_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    init_tracing(&config.server.log_format);

    tracing::info!("Starting Mcpgate Server");
    tracing::info!("Configuration: {:#?}", config);
    config.validate()?;

    let authenticator = build_authenticator(&config)?;

    let transport = HttpTransport::new(config.gateway.connect_timeout())
        .context("Failed to build HTTP client for remote MCP endpoints")?;
    let gateway = Gateway::new(config.gateway.clone(), Arc::new(transport)).spawn();

    let addr = config.socket_addr()?;
    let state = AppState {
        gateway,
        config: Arc::new(config),
    };
    let app = build_router(state, authenticator);

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Control plane: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Mcpgate Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
