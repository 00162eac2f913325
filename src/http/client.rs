//! HTTP client with retry logic and error normalization.

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::de::DeserializeOwned;

use super::retry::{RetryPolicy, classify_error};
use crate::error::EndpointError;

/// HTTP client shared by every network endpoint.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    /// Wrap an existing reqwest client with the default retry policy.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    /// Build a client with a per-request timeout.
    pub fn build(timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("boxpm/", env!("BOXPM_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, retry })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn get(&self, url: &str, bearer: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        if let Some(token) = bearer
            && let Ok(mut value) = HeaderValue::from_str(&format!("Bearer {}", token))
        {
            value.set_sensitive(true);
            request = request.header(AUTHORIZATION, value);
        }
        request
    }

    /// GET a JSON document. Transient failures are retried.
    #[tracing::instrument(skip(self, bearer))]
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<T, EndpointError> {
        debug!("GET JSON from {}...", url);

        self.retry
            .run("GET JSON", EndpointError::is_retryable, || async {
                let response = self
                    .get(url, bearer)
                    .send()
                    .await
                    .map_err(|e| classify_error(&e))?;
                let response = response
                    .error_for_status()
                    .map_err(|e| classify_error(&e))?;
                let bytes = response.bytes().await.map_err(|e| classify_error(&e))?;
                serde_json::from_slice::<T>(&bytes).map_err(|e| {
                    EndpointError::NetworkPermanent(format!("invalid JSON from {}: {}", url, e))
                })
            })
            .await
    }

    /// Download `url` into the writer produced by `create_writer`.
    ///
    /// A single attempt: the installation engine owns the retry loop for
    /// artifacts so that digest mismatches are retried too.
    #[tracing::instrument(skip(self, bearer, create_writer))]
    pub async fn download_file<W, F>(
        &self,
        url: &str,
        bearer: Option<&str>,
        create_writer: F,
    ) -> Result<u64, EndpointError>
    where
        W: Write,
        F: FnOnce() -> Result<W>,
    {
        debug!("Downloading file from {}...", url);

        let response = self
            .get(url, bearer)
            .send()
            .await
            .map_err(|e| classify_error(&e))?;
        let mut response = response
            .error_for_status()
            .map_err(|e| classify_error(&e))?;

        let mut writer = create_writer().map_err(EndpointError::corrupt)?;
        let mut downloaded_bytes: u64 = 0;

        while let Some(chunk) = response.chunk().await.map_err(|e| classify_error(&e))? {
            writer
                .write_all(&chunk)
                .map_err(|e| EndpointError::corrupt(format!("failed to write chunk: {}", e)))?;
            downloaded_bytes += chunk.len() as u64;
        }
        writer.flush().map_err(EndpointError::corrupt)?;

        debug!(
            "Downloaded {:.2} MB",
            downloaded_bytes as f64 / (1024.0 * 1024.0)
        );

        Ok(downloaded_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client() -> HttpClient {
        HttpClient::new(Client::new()).with_retry_policy(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_get_json_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/packages/foo")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name": "foo", "value": 42}"#)
            .create_async()
            .await;

        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct TestResponse {
            name: String,
            value: i32,
        }

        let result: TestResponse = client()
            .get_json(&format!("{}/packages/foo", server.url()), None)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.name, "foo");
        assert_eq!(result.value, 42);
    }

    #[tokio::test]
    async fn test_get_json_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/packages/foo")
            .match_header("Authorization", "Bearer s3cret")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let _: serde_json::Value = client()
            .get_json(&format!("{}/packages/foo", server.url()), Some("s3cret"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_json_without_token_sends_no_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/packages/foo")
            .match_header("Authorization", Matcher::Missing)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let _: serde_json::Value = client()
            .get_json(&format!("{}/packages/foo", server.url()), None)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_json_not_found_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/packages/missing")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let result: Result<serde_json::Value, _> = client()
            .get_json(&format!("{}/packages/missing", server.url()), None)
            .await;

        mock.assert_async().await;
        assert!(matches!(result, Err(EndpointError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_get_json_server_error_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/packages/flaky")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let result: Result<serde_json::Value, _> = client()
            .get_json(&format!("{}/packages/flaky", server.url()), None)
            .await;

        mock.assert_async().await;
        assert!(matches!(result, Err(EndpointError::NetworkTransient(_))));
    }

    #[tokio::test]
    async fn test_get_json_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/packages/private")
            .with_status(401)
            .create_async()
            .await;

        let result: Result<serde_json::Value, _> = client()
            .get_json(&format!("{}/packages/private", server.url()), None)
            .await;
        assert!(matches!(result, Err(EndpointError::AuthRequired(_))));
    }

    #[tokio::test]
    async fn test_download_file_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/file.tgz")
            .with_status(200)
            .with_body("test content")
            .create_async()
            .await;

        let bytes = client()
            .download_file(&format!("{}/file.tgz", server.url()), None, || {
                Ok(std::io::sink())
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(bytes, 12);
    }

    #[tokio::test]
    async fn test_download_file_not_found() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/file.tgz")
            .with_status(404)
            .create_async()
            .await;

        let result = client()
            .download_file(&format!("{}/file.tgz", server.url()), None, || {
                Ok(std::io::sink())
            })
            .await;

        mock.assert_async().await;
        assert!(matches!(result, Err(EndpointError::NotFound(_))));
    }
}
