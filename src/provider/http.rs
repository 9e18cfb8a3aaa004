//! JSON-over-HTTP provider.
//!
//! Forwards each call to a provider endpoint as
//! `POST {endpoint}/resources/{type}/{operation}` and reads the resource's
//! outputs from the response body.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::graph::Outputs;

use super::{ApplyRequest, Operation, ResourceProvider};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Fallback wait when a 429 carries no usable `retry-after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// HTTP bridge to a remote provider endpoint.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Endpoint base URL, without trailing slash.
    endpoint: String,
    /// Bearer token, if the endpoint requires one.
    token: Option<String>,
    /// Base delay between retries.
    retry_delay: Duration,
}

/// Request body sent to the endpoint.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    name: &'a str,
    inputs: &'a Outputs,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
}

/// Response body returned by the endpoint.
#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    outputs: Outputs,
}

impl HttpProvider {
    /// Creates a provider for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self, ProviderError> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provider with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        endpoint: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Overrides the base delay between retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Returns the URL a request is sent to.
    fn url(&self, request: &ApplyRequest) -> String {
        format!(
            "{}/resources/{}/{}",
            self.endpoint,
            request.resource_type(),
            request.operation
        )
    }

    /// Sends a single request.
    async fn send_once(&self, request: &ApplyRequest) -> Result<Outputs, ProviderError> {
        let url = self.url(request);
        trace!("POST {url}");

        let body = WireRequest {
            name: &request.name,
            inputs: &request.inputs,
            id: request.id.as_deref(),
        };

        let mut builder = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(token) = &self.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed {
                message: format!("Endpoint rejected credentials ({status})"),
            });
        }

        if status == StatusCode::NOT_FOUND && request.id.is_some() {
            return Err(ProviderError::NotFound {
                id: request.id.clone().unwrap_or_default(),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::request(status.as_u16(), body));
        }

        let wire: WireResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            }
        })?;

        if request.operation == Operation::Create && !wire.outputs.contains_key("id") {
            return Err(ProviderError::InvalidResponse {
                message: format!("Create of '{}' returned no id", request.name),
            });
        }

        Ok(wire.outputs)
    }
}

#[async_trait]
impl ResourceProvider for HttpProvider {
    async fn apply(&self, request: ApplyRequest) -> Result<Outputs, ProviderError> {
        let mut last_error = None;
        let mut wait = self.retry_delay;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!(
                    "Retry attempt {attempt} of {MAX_RETRIES} for {} '{}' in {wait:?}",
                    request.operation, request.name
                );
                tokio::time::sleep(wait).await;
            }

            match self.send_once(&request).await {
                Ok(outputs) => return Ok(outputs),
                Err(e) if e.is_retryable() => {
                    wait = match &e {
                        ProviderError::RateLimited { retry_after_secs } => {
                            Duration::from_secs(*retry_after_secs)
                        }
                        _ => self.retry_delay * (attempt + 1),
                    };
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::network("Max retries exceeded")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_request() -> ApplyRequest {
        let mut inputs = Outputs::new();
        inputs.insert(String::from("region"), json!("us-east"));
        ApplyRequest {
            kind: String::from("linode:instance"),
            operation: Operation::Create,
            name: String::from("seafileInstance"),
            inputs,
            id: None,
        }
    }

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), Some(String::from("secret")))
            .expect("client")
            .with_retry_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_create_posts_inputs_and_reads_outputs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/instance/create"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "name": "seafileInstance",
                "inputs": { "region": "us-east" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": { "id": "linode-42", "ipAddress": "192.0.2.7" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outputs = provider(&server)
            .apply(create_request())
            .await
            .expect("created");
        assert_eq!(outputs["id"], json!("linode-42"));
        assert_eq!(outputs["ipAddress"], json!("192.0.2.7"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": { "id": "linode-1" }
            })))
            .mount(&server)
            .await;

        let outputs = provider(&server)
            .apply(create_request())
            .await
            .expect("eventually created");
        assert_eq!(outputs["id"], json!("linode-1"));
    }

    #[tokio::test]
    async fn test_rate_limit_waits_for_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": { "id": "linode-3" }
            })))
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let outputs = provider(&server)
            .apply(create_request())
            .await
            .expect("created after rate limit");
        assert_eq!(outputs["id"], json!("linode-3"));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid region"))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server)
            .apply(create_request())
            .await
            .expect_err("rejected");
        assert!(matches!(err, ProviderError::RequestFailed { status: 422, ref message } if message == "invalid region"));
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = provider(&server)
            .apply(create_request())
            .await
            .expect_err("unauthorized");
        assert!(matches!(err, ProviderError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/volume/delete"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let request = ApplyRequest {
            kind: String::from("linode:volume"),
            operation: Operation::Delete,
            name: String::from("seafileVolume"),
            inputs: Outputs::new(),
            id: Some(String::from("volume-9")),
        };

        let err = provider(&server).apply(request).await.expect_err("gone");
        assert!(matches!(err, ProviderError::NotFound { ref id } if id == "volume-9"));
    }

    #[tokio::test]
    async fn test_create_without_id_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "outputs": {} })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .apply(create_request())
            .await
            .expect_err("no id");
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }
}
