//! Upstream HTTPS API client.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::error::BridgeError;
use crate::transform::{ApiRequest, ApiReply};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the upstream JSON API.
///
/// Retries transient failures internally with a linearly scaled delay
/// (`retry_delay × attempt`) and surfaces only the final error; callers treat
/// one `send` as one logical attempt.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl UpstreamClient {
    /// Builds the client from configuration.
    pub fn new(config: &ApiConfig) -> Result<Self, BridgeError> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_idle_conns_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(USER_AGENT);

        if config.tls_insecure_skip {
            warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        })
    }

    /// Sends a request, retrying up to the configured attempt ceiling.
    ///
    /// A 2xx status with a parseable JSON body is success; anything else
    /// counts as a failed attempt.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiReply, BridgeError> {
        let mut last_err = BridgeError::UpstreamTransport("no attempts made".into());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay * attempt).await;
                debug!(
                    request_id = %request.request_id,
                    attempt,
                    "retrying upstream request"
                );
            }

            match self.send_once(request).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!(
                        request_id = %request.request_id,
                        attempt,
                        error = %e,
                        "upstream request failed"
                    );
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<ApiReply, BridgeError> {
        let started = std::time::Instant::now();

        let response = self
            .client
            .post(&self.base_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| BridgeError::UpstreamTransport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| BridgeError::UpstreamTransport(e.to_string()))?;

        debug!(
            request_id = %request.request_id,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "upstream request completed"
        );

        if !status.is_success() {
            return Err(BridgeError::UpstreamStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        serde_json::from_slice(&body).map_err(|e| BridgeError::UpstreamBody(e.to_string()))
    }

    /// Issues a GET to the base URL; 5xx counts as unhealthy.
    pub async fn health_check(&self) -> Result<(), BridgeError> {
        let response = self
            .client
            .get(&self.base_url)
            .send()
            .await
            .map_err(|e| BridgeError::UpstreamTransport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BridgeError::UpstreamStatus {
                status: status.as_u16(),
                body: String::new(),
            });
        }

        debug!(status = status.as_u16(), "upstream health check passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ApiConfig {
        ApiConfig {
            base_url: "https://api.example.com/v1/ingest/".into(),
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            max_idle_conns: 10,
            max_idle_conns_per_host: 2,
            tls_insecure_skip: false,
        }
    }

    #[test]
    fn client_creation_strips_trailing_slash() {
        let client = UpstreamClient::new(&test_config()).unwrap();
        assert_eq!(client.base_url, "https://api.example.com/v1/ingest");
    }

    #[test]
    fn insecure_flag_builds() {
        let config = ApiConfig {
            tls_insecure_skip: true,
            ..test_config()
        };
        assert!(UpstreamClient::new(&config).is_ok());
    }
}
