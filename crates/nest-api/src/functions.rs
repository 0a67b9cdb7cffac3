use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{TimeDelta, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use nest_types::api::{
    CallClaims, CallTokenRequest, CallTokenResponse, Claims, InsightRequest, InsightResponse,
    SendPushRequest, SendPushResponse,
};
use nest_types::events::ChangeKind;

use crate::state::{AppState, CallTokenConfig, InsightConfig};

const MAX_PUSH_RECIPIENTS: usize = 500;

/// Persist a notification per recipient and announce each insert. Device
/// push delivery is logged only.
pub async fn send_push(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendPushRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.title.trim().is_empty() || req.user_ids.is_empty() || req.user_ids.len() > MAX_PUSH_RECIPIENTS {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut recipients = req.user_ids.clone();
    recipients.sort();
    recipients.dedup();

    let data = req.data.unwrap_or_else(|| json!({}));
    let (title, body) = (req.title, req.body);
    let rows = state
        .blocking(move |db| db.insert_notifications(&recipients, &title, &body, &data))
        .await?;

    for row in &rows {
        state.publish(ChangeKind::Insert, "notifications", row);
    }
    info!(
        "{} ({}) sent push to {} users (push gateway delivery logged only)",
        claims.username,
        claims.sub,
        rows.len()
    );

    Ok((
        StatusCode::CREATED,
        Json(SendPushResponse {
            notification_ids: rows.iter().map(|n| n.id).collect(),
        }),
    ))
}

pub async fn call_token(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CallTokenRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let room = req.room.trim();
    if room.is_empty() || room.len() > 128 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let response = issue_call_token(&state.call_tokens, &claims, room).map_err(|e| {
        error!("failed to sign call token: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    info!("call token issued to {} for room {}", claims.sub, room);
    Ok(Json(response))
}

pub fn issue_call_token(
    config: &CallTokenConfig,
    claims: &Claims,
    room: &str,
) -> Result<CallTokenResponse, jsonwebtoken::errors::Error> {
    let issued_at = Utc::now();
    let ttl = TimeDelta::from_std(config.ttl).unwrap_or(TimeDelta::hours(1));
    let expires_at = issued_at + ttl;
    let call_claims = CallClaims {
        sub: claims.sub,
        name: claims.username.clone(),
        room: room.to_string(),
        iat: issued_at.timestamp() as usize,
        exp: expires_at.timestamp() as usize,
    };
    let token = encode(
        &Header::default(),
        &call_claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )?;

    Ok(CallTokenResponse {
        token,
        room: room.to_string(),
        expires_at,
    })
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

const INSIGHT_PROMPT: &str = "You are a warm, practical assistant for a community of mothers. \
Give a short, supportive insight on the question below. Do not give medical diagnoses; \
suggest seeing a professional when it matters.";

/// Ask the language model about one of the caller's questions and store the
/// answer on the question row.
pub async fn ai_insight(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<InsightRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let config = state.insight.clone().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;

    let question_id = req.question_id;
    let question = state
        .blocking(move |db| db.get_question(question_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    if question.user_id != claims.sub {
        return Err(StatusCode::FORBIDDEN);
    }

    let prompt = format!("{}\n\n{}", question.title, question.body);
    let insight = request_insight(&state.http, &config, &prompt).await.map_err(|e| {
        warn!("insight request for question {} failed: {:#}", question_id, e);
        StatusCode::BAD_GATEWAY
    })?;

    let stored = insight.clone();
    let updated = state
        .blocking(move |db| db.set_question_insight(question_id, &stored))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    state.publish(ChangeKind::Update, "questions", &updated);

    Ok(Json(InsightResponse { question_id, insight }))
}

async fn request_insight(http: &reqwest::Client, config: &InsightConfig, prompt: &str) -> anyhow::Result<String> {
    let body = json!({
        "model": config.model,
        "messages": [
            { "role": "system", "content": INSIGHT_PROMPT },
            { "role": "user", "content": prompt },
        ],
    });

    let mut request = http.post(&config.url).json(&body);
    if let Some(key) = &config.api_key {
        request = request.bearer_auth(key);
    }
    let completion: ChatCompletion = request.send().await?.error_for_status()?.json().await?;

    extract_insight(completion).ok_or_else(|| anyhow::anyhow!("completion had no content"))
}

fn extract_insight(completion: ChatCompletion) -> Option<String> {
    completion
        .choices
        .into_iter()
        .find_map(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
}
