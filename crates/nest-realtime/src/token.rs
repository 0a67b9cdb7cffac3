use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use nest_types::api::{CallTokenRequest, CallTokenResponse};

use crate::error::RealtimeError;

/// Bounded exponential backoff for calls worth retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Wait before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error or runs out
/// of attempts.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RealtimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RealtimeError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!("attempt {} failed: {}; retrying in {:?}", attempt, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fetches audio/video call tokens from the `call-token` function.
#[derive(Clone)]
pub struct CallTokenClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
    policy: RetryPolicy,
}

impl CallTokenClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            access_token,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn fetch(&self, room: &str) -> Result<CallTokenResponse, RealtimeError> {
        let access_token = self.access_token.as_deref().ok_or(RealtimeError::AuthRequired)?;
        let url = format!("{}/functions/call-token", self.base_url.trim_end_matches('/'));

        let response = with_retry(&self.policy, || async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(access_token)
                .json(&CallTokenRequest { room: room.to_string() })
                .send()
                .await?;
            match response.status() {
                StatusCode::UNAUTHORIZED => Err(RealtimeError::AuthRequired),
                status if !status.is_success() => Err(RealtimeError::HttpStatus(status)),
                _ => Ok(response.json::<CallTokenResponse>().await?),
            }
        })
        .await?;

        debug!("call token issued for room {}", response.room);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_store_errors_up_to_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RealtimeError::store("offline"))
        })
        .await;
        assert!(matches!(result, Err(RealtimeError::Store(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RealtimeError::AuthRequired)
        })
        .await;
        assert!(matches!(result, Err(RealtimeError::AuthRequired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RealtimeError::store("blip"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RealtimeError::HttpStatus(StatusCode::FORBIDDEN))
        })
        .await;
        assert!(matches!(result, Err(RealtimeError::HttpStatus(StatusCode::FORBIDDEN))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn signed_out_client_never_calls_out() {
        let client = CallTokenClient::new(reqwest::Client::new(), "http://127.0.0.1:9", None);
        assert!(matches!(client.fetch("room").await, Err(RealtimeError::AuthRequired)));
    }
}
