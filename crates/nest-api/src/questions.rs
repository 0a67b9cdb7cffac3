use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use uuid::Uuid;

use nest_types::api::{Claims, CreateQuestionRequest};
use nest_types::events::ChangeKind;

use crate::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateQuestionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let title = req.title.trim().to_string();
    if title.is_empty() || title.len() > 200 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let user_id = claims.sub;
    let question = state
        .blocking(move |db| db.insert_question(Uuid::new_v4(), user_id, &title, &req.body))
        .await?;

    state.publish(ChangeKind::Insert, "questions", &question);
    Ok((StatusCode::CREATED, Json(question)))
}
