use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{AlertRole, Notification};

// -- JWT Claims --

/// JWT claims shared by nest-api (REST middleware) and the gateway upgrade
/// path. Tokens are issued by the hosted auth service; this system only
/// validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Notifications --

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationsResponse {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkAllReadResponse {
    pub updated: u64,
}

// -- Emergency alerts --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateAlertRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LocationUpdateRequest {
    pub role: AlertRole,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
}

// -- Questions --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateQuestionRequest {
    pub title: String,
    pub body: String,
}

// -- Serverless functions --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SendPushRequest {
    pub user_ids: Vec<Uuid>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendPushResponse {
    pub notification_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CallTokenRequest {
    pub room: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTokenResponse {
    pub token: String,
    pub room: String,
    pub expires_at: DateTime<Utc>,
}

/// Claims carried by an audio/video call token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallClaims {
    pub sub: Uuid,
    pub name: String,
    pub room: String,
    pub iat: usize,
    pub exp: usize,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InsightRequest {
    pub question_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsightResponse {
    pub question_id: Uuid,
    pub insight: String,
}
