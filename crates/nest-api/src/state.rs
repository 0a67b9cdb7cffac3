use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;
use tracing::{debug, error};

use nest_db::Database;
use nest_realtime::Hub;
use nest_types::events::{ChangeKind, RowChange};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub hub: Hub,
    pub jwt_secret: String,
    pub call_tokens: CallTokenConfig,
    /// `None` disables the AI insight function.
    pub insight: Option<InsightConfig>,
    pub http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct CallTokenConfig {
    pub secret: String,
    pub ttl: Duration,
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct InsightConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl AppStateInner {
    /// Run a DB call off the async runtime.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, StatusCode>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .map_err(|e| {
                error!("database error: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })
    }

    /// Publish a written row to realtime subscribers.
    pub(crate) fn publish<T: Serialize>(&self, kind: ChangeKind, table: &str, row: &T) {
        let value = match serde_json::to_value(row) {
            Ok(value) => value,
            Err(e) => {
                error!("failed to encode {} row: {}", table, e);
                return;
            }
        };
        let change = match kind {
            ChangeKind::Insert => RowChange::insert(table, value),
            ChangeKind::Update => RowChange::update(table, value),
            ChangeKind::Delete => RowChange::delete(table, value),
        };
        let subscribers = self.hub.publish_change(change);
        debug!("{:?} on {} handed to {} change subscribers", kind, table, subscribers);
    }
}
