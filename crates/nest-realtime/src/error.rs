use thiserror::Error;
use uuid::Uuid;

use crate::location::LocationError;

/// Errors surfaced by the sync layer.
///
/// Handling by class: `AuthRequired` blocks the operation; `Store` and `Http`
/// are shown to the user as a toast and the operation is abandoned;
/// `Location` is reported once and tracking goes idle; transport errors are
/// logged and the next mount re-subscribes.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("you need to be signed in to do that")]
    AuthRequired,

    #[error("realtime transport is closed")]
    TransportClosed,

    #[error("invalid channel topic {0:?}")]
    InvalidTopic(String),

    #[error("channel {0} is no longer subscribed")]
    ChannelReleased(Uuid),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request rejected with status {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl RealtimeError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    /// Only network-class failures are worth retrying: connection and
    /// timeout errors, 5xx and 429. Any other 4xx fails fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(_) => true,
            Self::Http(err) => match err.status() {
                Some(status) => retryable_status(status),
                None => err.is_connect() || err.is_timeout() || err.is_request(),
            },
            Self::HttpStatus(status) => retryable_status(*status),
            _ => false,
        }
    }

    /// Text for a transient user-facing toast.
    pub fn user_message(&self) -> String {
        match self {
            Self::AuthRequired => "Please sign in to continue".to_string(),
            Self::Location(err) => err.reason().to_string(),
            Self::Store(_) | Self::Http(_) | Self::HttpStatus(_) => {
                "Something went wrong. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

fn retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}
