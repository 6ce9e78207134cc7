//! HTTP transport for keystroke payloads.
//!
//! This module posts payload batches to the ingestion API with:
//!
//! - Connection pooling via reqwest
//! - A single-attempt path for interactive "send now" flushes
//! - Exponential backoff retry (1s → 60s max, ±25% jitter) for drained batches
//! - Rate limit handling (429 with Retry-After header)
//!
//! # Example
//!
//! ```no_run
//! use keystats_monitor::sender::{Sender, SenderConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SenderConfig::new("https://api.example.com".to_string(), None);
//!     let mut sender = Sender::new(config);
//!
//!     sender.send_batch("/data/batch", &[]).await.unwrap();
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::types::KeystrokePayload;

/// Initial retry delay in seconds.
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Maximum retry delay in seconds.
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Maximum number of attempts before giving up on a batch.
const MAX_RETRY_ATTEMPTS: u32 = 10;

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Errors that can occur while sending payloads.
#[derive(Error, Debug)]
pub enum SenderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error status.
    #[error("server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// Authentication failed (401).
    #[error("authentication failed: invalid or expired token")]
    AuthFailed,

    /// Rate limited (429).
    #[error("rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// Maximum retry attempts exceeded.
    #[error("max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid header value (token contains invalid characters).
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

/// Backoff parameters for retried batch sends.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.25 = ±25%).
    pub jitter_factor: f64,
    /// Attempts (including the first) before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
            max_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            jitter_factor: JITTER_FACTOR,
            max_attempts: MAX_RETRY_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Millisecond delays and few attempts, for tests against mock servers.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            jitter_factor: 0.0,
            max_attempts: 3,
        }
    }

    /// Overrides the attempt limit.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Configuration for the sender.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// API base URL (e.g., `https://api.example.com`).
    pub api_url: String,

    /// Bearer token sent with every request, if any.
    pub api_token: Option<String>,

    /// Backoff used by [`Sender::send_batch`].
    pub retry_policy: RetryPolicy,
}

impl SenderConfig {
    /// Creates a sender configuration with the default retry policy.
    #[must_use]
    pub fn new(api_url: String, api_token: Option<String>) -> Self {
        Self {
            api_url,
            api_token,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// HTTP payload sender.
///
/// Cloning is cheap; clones share the connection pool but keep their own
/// backoff state.
#[derive(Clone)]
pub struct Sender {
    config: SenderConfig,
    client: Client,
    current_retry_delay: Duration,
}

impl Sender {
    /// Creates a new sender with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialized.
    #[must_use]
    pub fn new(config: SenderConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            current_retry_delay: config.retry_policy.initial_delay,
            config,
            client,
        }
    }

    /// Returns the sender configuration.
    #[must_use]
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Posts a batch once, without retrying.
    ///
    /// # Errors
    ///
    /// Returns `SenderError` on any transport failure or non-success status.
    pub async fn send_once(
        &self,
        path: &str,
        payloads: &[KeystrokePayload],
    ) -> Result<(), SenderError> {
        let url = self.url(path);
        let body = serde_json::to_string(payloads)?;

        debug!(url = %url, payloads = payloads.len(), "Sending payload batch once");

        let response = self.post(&url, body).await?;
        let status = response.status();

        if status.is_success() {
            info!(payloads = payloads.len(), "Payloads sent");
            return Ok(());
        }

        match status {
            StatusCode::UNAUTHORIZED => Err(SenderError::AuthFailed),
            StatusCode::TOO_MANY_REQUESTS => Err(SenderError::RateLimited {
                retry_after_secs: self.parse_retry_after(&response),
            }),
            _ => {
                let message = response.text().await.unwrap_or_default();
                Err(SenderError::ServerError {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    /// Posts a batch, retrying transient failures with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns `SenderError` if the batch cannot be sent after all retries, or
    /// immediately on authentication and other client errors.
    pub async fn send_batch(
        &mut self,
        path: &str,
        payloads: &[KeystrokePayload],
    ) -> Result<(), SenderError> {
        let url = self.url(path);
        let body = serde_json::to_string(payloads)?;
        let max_attempts = self.config.retry_policy.max_attempts;

        let mut attempts = 0;

        loop {
            attempts += 1;

            debug!(
                url = %url,
                payloads = payloads.len(),
                attempt = attempts,
                "Sending payload batch"
            );

            match self.post(&url, body.clone()).await {
                Ok(response) => {
                    let status = response.status();

                    match status {
                        _ if status.is_success() => {
                            info!(payloads = payloads.len(), "Payload batch sent");
                            self.reset_retry_delay();
                            return Ok(());
                        }
                        StatusCode::UNAUTHORIZED => {
                            error!("Authentication failed");
                            return Err(SenderError::AuthFailed);
                        }
                        StatusCode::TOO_MANY_REQUESTS => {
                            let retry_after = self.parse_retry_after(&response);
                            warn!(retry_after_secs = retry_after, "Rate limited by server");

                            if attempts >= max_attempts {
                                return Err(SenderError::MaxRetriesExceeded { attempts });
                            }

                            sleep(Duration::from_secs(retry_after)).await;
                            continue;
                        }
                        _ if status.is_server_error() => {
                            let message = response.text().await.unwrap_or_default();
                            warn!(
                                status = status.as_u16(),
                                message = %message,
                                "Server error, will retry"
                            );

                            if attempts >= max_attempts {
                                return Err(SenderError::ServerError {
                                    status: status.as_u16(),
                                    message,
                                });
                            }

                            self.wait_with_backoff().await;
                            continue;
                        }
                        _ => {
                            let message = response.text().await.unwrap_or_default();
                            return Err(SenderError::ServerError {
                                status: status.as_u16(),
                                message,
                            });
                        }
                    }
                }
                Err(SenderError::Http(e)) if e.is_timeout() || e.is_connect() => {
                    warn!(error = %e, "Connection error, will retry");

                    if attempts >= max_attempts {
                        return Err(SenderError::MaxRetriesExceeded { attempts });
                    }

                    self.wait_with_backoff().await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn post(&self, url: &str, body: String) -> Result<Response, SenderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.config.api_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            headers.insert(AUTHORIZATION, value);
        }

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }

    /// Parses the Retry-After header from a 429 response.
    fn parse_retry_after(&self, response: &Response) -> u64 {
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(self.current_retry_delay.as_secs())
    }

    /// Waits for the current retry delay with jitter, then increases the delay.
    async fn wait_with_backoff(&mut self) {
        let delay = self.add_jitter(self.current_retry_delay);
        debug!(delay_ms = delay.as_millis(), "Waiting before retry");
        sleep(delay).await;
        self.increase_retry_delay();
    }

    /// Adds ±`jitter_factor` jitter to a duration.
    fn add_jitter(&self, duration: Duration) -> Duration {
        let jitter_range = duration.as_secs_f64() * self.config.retry_policy.jitter_factor;
        if jitter_range <= 0.0 {
            return duration;
        }
        let mut rng = rand::rng();
        let jitter = rng.random_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.0))
    }

    /// Doubles the retry delay up to the maximum.
    fn increase_retry_delay(&mut self) {
        let doubled = self.current_retry_delay * 2;
        self.current_retry_delay = doubled.min(self.config.retry_policy.max_delay);
    }

    /// Resets the retry delay to the initial value.
    fn reset_retry_delay(&mut self) {
        self.current_retry_delay = self.config.retry_policy.initial_delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_sender() -> Sender {
        let config = SenderConfig::new("http://localhost:8080".to_string(), None);
        Sender::new(config)
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_delay.as_secs(), INITIAL_RETRY_DELAY_SECS);
        assert_eq!(policy.max_delay.as_secs(), MAX_RETRY_DELAY_SECS);
        assert_eq!(policy.max_attempts, MAX_RETRY_ATTEMPTS);
    }

    #[test]
    fn test_with_max_attempts_floors_at_one() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryPolicy::default().with_max_attempts(4).max_attempts, 4);
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let config = SenderConfig::new("https://api.example.com/".to_string(), None);
        let sender = Sender::new(config);
        assert_eq!(sender.url("/data/batch"), "https://api.example.com/data/batch");
    }

    #[test]
    fn test_add_jitter_stays_within_bounds() {
        let sender = create_test_sender();
        let base = Duration::from_secs(10);

        for _ in 0..100 {
            let jittered = sender.add_jitter(base);
            let secs = jittered.as_secs_f64();
            // Should be within ±25% of 10 seconds
            assert!(
                (7.5..=12.5).contains(&secs),
                "Jitter out of bounds: {}",
                secs
            );
        }
    }

    #[test]
    fn test_zero_jitter_keeps_duration() {
        let config = SenderConfig::new("http://localhost:8080".to_string(), None)
            .with_retry_policy(RetryPolicy::fast_for_tests());
        let sender = Sender::new(config);
        assert_eq!(
            sender.add_jitter(Duration::from_millis(10)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_increase_retry_delay_doubles() {
        let mut sender = create_test_sender();
        assert_eq!(
            sender.current_retry_delay.as_secs(),
            INITIAL_RETRY_DELAY_SECS
        );

        sender.increase_retry_delay();
        assert_eq!(sender.current_retry_delay.as_secs(), 2);

        sender.increase_retry_delay();
        assert_eq!(sender.current_retry_delay.as_secs(), 4);
    }

    #[test]
    fn test_increase_retry_delay_caps_at_max() {
        let mut sender = create_test_sender();
        sender.current_retry_delay = Duration::from_secs(MAX_RETRY_DELAY_SECS);

        sender.increase_retry_delay();
        assert_eq!(sender.current_retry_delay.as_secs(), MAX_RETRY_DELAY_SECS);
    }

    #[test]
    fn test_reset_retry_delay() {
        let mut sender = create_test_sender();
        sender.current_retry_delay = Duration::from_secs(30);

        sender.reset_retry_delay();
        assert_eq!(
            sender.current_retry_delay.as_secs(),
            INITIAL_RETRY_DELAY_SECS
        );
    }

    #[test]
    fn test_sender_error_display() {
        assert_eq!(
            SenderError::AuthFailed.to_string(),
            "authentication failed: invalid or expired token"
        );
        assert_eq!(
            SenderError::RateLimited {
                retry_after_secs: 5
            }
            .to_string(),
            "rate limited, retry after 5 seconds"
        );
        assert_eq!(
            SenderError::MaxRetriesExceeded { attempts: 3 }.to_string(),
            "max retries exceeded after 3 attempts"
        );
    }
}
