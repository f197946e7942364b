//! Payload transformation between client binary and upstream JSON.
//!
//! The binary↔JSON mapping is site-specific. The processor depends only on
//! the [`PayloadTransformer`] seam; [`Base64Transformer`] is the stock
//! implementation for deployments without a structured layout.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use portway_store::StagedJob;

use crate::error::BridgeError;

/// JSON body sent to the upstream API.
#[derive(Debug, Clone, Serialize)]
pub struct ApiRequest {
    /// Staged-row id, echoed back by the upstream as the correlation key.
    pub request_id: String,
    /// Submission time, RFC 3339.
    pub timestamp: String,
    /// Routing target; carried for upstream-side audit.
    pub client_port: u16,
    /// Transformed payload.
    pub data: serde_json::Value,
}

/// JSON body received from the upstream API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiReply {
    /// Correlation key echoing the request id.
    #[serde(default)]
    pub request_id: String,
    /// Upstream processing status.
    #[serde(default)]
    pub status: String,
    /// Application-level status code.
    #[serde(default)]
    pub status_code: i32,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Reply payload.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Upstream timestamp, RFC 3339.
    #[serde(default)]
    pub timestamp: String,
}

impl ApiReply {
    /// Validates that the reply carries the fields the pipeline relies on.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.request_id.is_empty() {
            return Err(BridgeError::Transform("reply missing request_id".into()));
        }
        if self.status.is_empty() {
            return Err(BridgeError::Transform("reply missing status".into()));
        }
        Ok(())
    }
}

/// Conversion seam between staged binary payloads and the upstream JSON
/// contract.
pub trait PayloadTransformer: Send + Sync {
    /// Builds the upstream request body for a staged job.
    fn to_api_request(&self, job: &StagedJob) -> Result<ApiRequest, BridgeError>;

    /// Converts an upstream reply back to the client's wire payload.
    fn to_wire(&self, reply: &ApiReply) -> Result<Vec<u8>, BridgeError>;
}

/// Stock transformer: embeds raw bytes base64-encoded, or passes payloads
/// through unchanged when they already parse as a JSON object.
#[derive(Debug, Default)]
pub struct Base64Transformer;

impl Base64Transformer {
    /// Creates the stock transformer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl PayloadTransformer for Base64Transformer {
    fn to_api_request(&self, job: &StagedJob) -> Result<ApiRequest, BridgeError> {
        if job.binary_data.is_empty() {
            return Err(BridgeError::Transform("binary data is empty".into()));
        }

        // Payloads that are already JSON objects travel as-is.
        let data = match serde_json::from_slice::<serde_json::Value>(&job.binary_data) {
            Ok(value) if value.is_object() => value,
            _ => json!({
                "binary_data": BASE64.encode(&job.binary_data),
                "data_length": job.binary_data.len(),
                "encoding": "base64",
                "format": "binary",
            }),
        };

        Ok(ApiRequest {
            request_id: job.id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            client_port: job.client_port,
            data,
        })
    }

    fn to_wire(&self, reply: &ApiReply) -> Result<Vec<u8>, BridgeError> {
        // A base64 body embedded by the upstream is returned raw.
        if let Some(data) = &reply.data {
            if let Some(encoded) = data.get("binary_data").and_then(|v| v.as_str()) {
                return BASE64
                    .decode(encoded)
                    .map_err(|e| BridgeError::Transform(format!("invalid base64 data: {e}")));
            }
        }

        // Otherwise the whole reply is serialised for the client.
        serde_json::to_vec(&json!({
            "request_id": reply.request_id,
            "status": reply.status,
            "status_code": reply.status_code,
            "message": reply.message,
            "data": reply.data,
            "timestamp": reply.timestamp,
        }))
        .map_err(|e| BridgeError::Transform(format!("reply serialisation failed: {e}")))
    }
}
