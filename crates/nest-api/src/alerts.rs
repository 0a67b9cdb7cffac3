use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use nest_types::api::{Claims, CreateAlertRequest, LocationUpdateRequest};
use nest_types::events::ChangeKind;
use nest_types::models::AlertRole;

use crate::state::AppState;

fn valid_position(latitude: f64, longitude: f64) -> bool {
    (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

pub async fn create(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateAlertRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    match (req.latitude, req.longitude) {
        (Some(lat), Some(lng)) if !valid_position(lat, lng) => return Err(StatusCode::BAD_REQUEST),
        (Some(_), None) | (None, Some(_)) => return Err(StatusCode::BAD_REQUEST),
        _ => {}
    }

    let user_id = claims.sub;
    let alert = state
        .blocking(move |db| {
            db.create_alert(
                Uuid::new_v4(),
                user_id,
                req.latitude,
                req.longitude,
                req.message.as_deref(),
            )
        })
        .await?;

    info!("{} ({}) raised alert {}", claims.username, user_id, alert.id);
    state.publish(ChangeKind::Insert, "emergency_alerts", &alert);
    Ok((StatusCode::CREATED, Json(alert)))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let alert = state
        .blocking(move |db| db.get_alert(id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(alert))
}

pub async fn helpers(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let helpers = state.blocking(move |db| db.list_alert_helpers(id)).await?;
    Ok(Json(helpers))
}

/// Join an alert as a helper. Responding twice returns the same row.
pub async fn respond(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(alert_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let helper_id = claims.sub;
    let alert = state
        .blocking(move |db| db.get_alert(alert_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    if alert.user_id == helper_id {
        return Err(StatusCode::BAD_REQUEST);
    }

    let helper = state
        .blocking(move |db| db.add_alert_helper(Uuid::new_v4(), alert_id, helper_id))
        .await?;

    state.publish(ChangeKind::Insert, "alert_helpers", &helper);
    Ok(Json(helper))
}

/// Live location write. Requesters update the alert row, helpers their own
/// response row; accuracy is only kept for helpers.
pub async fn update_location(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(alert_id): Path<Uuid>,
    Json(req): Json<LocationUpdateRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if !valid_position(req.latitude, req.longitude) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let actor_id = claims.sub;
    let (lat, lng) = (req.latitude, req.longitude);

    let row = match req.role {
        AlertRole::Requester => {
            let alert = state
                .blocking(move |db| db.update_requester_location(alert_id, actor_id, lat, lng))
                .await?
                .ok_or(StatusCode::NOT_FOUND)?;
            state.publish(ChangeKind::Update, "emergency_alerts", &alert);
            serde_json::to_value(alert)
        }
        AlertRole::Helper => {
            let accuracy = req.accuracy;
            let helper = state
                .blocking(move |db| db.update_helper_location(alert_id, actor_id, lat, lng, accuracy))
                .await?
                .ok_or(StatusCode::NOT_FOUND)?;
            state.publish(ChangeKind::Update, "alert_helpers", &helper);
            serde_json::to_value(helper)
        }
    }
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(row))
}
