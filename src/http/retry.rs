//! Retry policy and classification of HTTP failures.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use reqwest::StatusCode;

use crate::error::EndpointError;

/// Default number of attempts for a network operation.
pub const MAX_RETRIES: u32 = 3;

/// Default delay before the first retry, in milliseconds.
pub const RETRY_DELAY_MS: u64 = 500;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: MAX_RETRIES,
            base_delay: Duration::from_millis(RETRY_DELAY_MS),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with an error `should_retry`
    /// rejects, or attempts are exhausted. The last error is returned.
    pub async fn run<F, Fut, T, P>(
        &self,
        operation_name: &str,
        should_retry: P,
        operation: F,
    ) -> Result<T, EndpointError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, EndpointError>>,
        P: Fn(&EndpointError) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < attempts && should_retry(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {}ms...",
                        operation_name,
                        attempt,
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("{}: giving up after {} attempt(s): {}", operation_name, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

/// Map an HTTP status to an endpoint failure.
pub fn classify_status(status: StatusCode, url: &str) -> EndpointError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EndpointError::AuthRequired(format!(
            "HTTP {} from {}; check BOXPM_TOKEN",
            status.as_u16(),
            url
        )),
        StatusCode::NOT_FOUND => EndpointError::NotFound(url.to_string()),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            EndpointError::NetworkTransient(format!("HTTP {} from {}", status.as_u16(), url))
        }
        s if s.is_client_error() => {
            EndpointError::NetworkPermanent(format!("HTTP {} from {}", s.as_u16(), url))
        }
        s => EndpointError::NetworkTransient(format!("HTTP {} from {}", s.as_u16(), url)),
    }
}

/// Map a reqwest failure to an endpoint failure.
///
/// Status errors follow [`classify_status`]. Connection failures and timeouts
/// are transient. Body decoding and request construction failures are permanent.
pub fn classify_error(error: &reqwest::Error) -> EndpointError {
    let url = error
        .url()
        .map(|u| u.to_string())
        .unwrap_or_else(|| "<unknown>".to_string());
    if let Some(status) = error.status() {
        return classify_status(status, &url);
    }
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        return EndpointError::NetworkTransient(error.to_string());
    }
    EndpointError::NetworkPermanent(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_for_is_exponential_and_bounded() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn test_classify_status() {
        let url = "http://registry/packages/foo";
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, url),
            EndpointError::AuthRequired(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, url),
            EndpointError::AuthRequired(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, url),
            EndpointError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, url),
            EndpointError::NetworkPermanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, url),
            EndpointError::NetworkTransient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, url),
            EndpointError::NetworkTransient(_)
        ));
    }

    #[tokio::test]
    async fn test_classify_error_from_response() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .with_status(404)
            .create_async()
            .await;

        let response = reqwest::Client::new()
            .get(server.url())
            .send()
            .await
            .unwrap();
        let err = response.error_for_status().unwrap_err();
        assert!(matches!(classify_error(&err), EndpointError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_classify_error_connection_refused_is_transient() {
        // Nothing listens on port 9 of localhost
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:9/")
            .send()
            .await
            .unwrap_err();
        assert!(classify_error(&err).is_retryable());
    }

    #[tokio::test]
    async fn test_run_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = RetryPolicy::immediate(3)
            .run("test", EndpointError::is_retryable, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EndpointError::NetworkTransient("reset".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = RetryPolicy::immediate(3)
            .run("test", EndpointError::is_retryable, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(EndpointError::NotFound("foo".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(EndpointError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = RetryPolicy::immediate(4)
            .run("test", |_| true, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(EndpointError::CorruptArtifact("digest".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(EndpointError::CorruptArtifact(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
