mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use nest_api::middleware::decode_claims;
use nest_api::{AppState, AppStateInner};
use nest_gateway::{Gateway, connection};
use nest_realtime::Hub;

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    gateway: Gateway,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nest=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(nest_db::Database::open(&PathBuf::from(&config.db_path))?);
    let hub = Hub::default();
    if config.insight.is_none() {
        info!("NEST_INSIGHT_URL unset, AI insight disabled");
    }

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        hub: hub.clone(),
        jwt_secret: config.jwt_secret.clone(),
        call_tokens: config.call_tokens.clone(),
        insight: config.insight.clone(),
        http: reqwest::Client::new(),
    });

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(ServerState {
            gateway: Gateway::new(hub.clone()),
            jwt_secret: config.jwt_secret.clone(),
        });

    let app = Router::new()
        .merge(nest_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Nest server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    Ok(())
}

/// Browsers cannot set headers on a websocket upgrade, so the access token
/// rides in the query string.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let Some(claims) = decode_claims(&query.token, &state.jwt_secret) else {
        warn!("gateway upgrade rejected: invalid token");
        return Err(StatusCode::UNAUTHORIZED);
    };

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.gateway, claims.sub, claims.username)
    }))
}

async fn shutdown_signal(hub: Hub) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
    // Close every channel so websocket sessions see Left and wind down.
    hub.shutdown();
}
