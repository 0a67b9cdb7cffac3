use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use nest_realtime::unread_count;
use nest_types::api::{Claims, MarkAllReadResponse, NotificationsResponse};
use nest_types::events::ChangeKind;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<NotificationQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let limit = query.limit.clamp(1, 200);
    let user_id = claims.sub;
    let notifications = state
        .blocking(move |db| db.list_notifications(user_id, limit))
        .await?;

    Ok(Json(NotificationsResponse {
        unread_count: unread_count(&notifications),
        notifications,
    }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = claims.sub;
    let row = state
        .blocking(move |db| db.mark_notification_read(user_id, id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;

    state.publish(ChangeKind::Update, "notifications", &row);
    Ok(Json(row))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = claims.sub;
    let rows = state
        .blocking(move |db| db.mark_all_notifications_read(user_id))
        .await?;

    for row in &rows {
        state.publish(ChangeKind::Update, "notifications", row);
    }
    Ok(Json(MarkAllReadResponse {
        updated: rows.len() as u64,
    }))
}
