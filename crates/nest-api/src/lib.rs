//! REST endpoints and serverless functions. Every write is published on the
//! realtime hub so subscribed feeds follow the store.

pub mod alerts;
pub mod functions;
pub mod middleware;
pub mod notifications;
pub mod questions;
pub mod state;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};

pub use state::{AppState, AppStateInner, CallTokenConfig, InsightConfig};

/// All JWT-protected HTTP routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/notifications", get(notifications::list))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/{id}/read", post(notifications::mark_read))
        .route("/alerts", post(alerts::create))
        .route("/alerts/{id}", get(alerts::get))
        .route("/alerts/{id}/helpers", get(alerts::helpers))
        .route("/alerts/{id}/respond", post(alerts::respond))
        .route("/alerts/{id}/location", put(alerts::update_location))
        .route("/questions", post(questions::create))
        .route("/functions/send-push", post(functions::send_push))
        .route("/functions/call-token", post(functions::call_token))
        .route("/functions/ai-insight", post(functions::ai_insight))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}
