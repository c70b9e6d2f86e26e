use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BrokerError;

/// The outgoing wire request the broker hands off once selection,
/// refresh, project resolution, and sanitization are all done. Building
/// the request line/headers/body from this is the caller's concern; the
/// broker only ever deals in `Transport`, never a concrete HTTP client.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_auth_error(&self) -> bool {
        self.status == 401
            || self
                .body
                .get("error")
                .and_then(|e| e.get("status").or_else(|| e.get("code")))
                .and_then(Value::as_str)
                .is_some_and(|s| s == "invalid_grant" || s == "UNAUTHENTICATED")
    }
}

/// The HTTP-capable fetcher the broker is handed at construction time.
/// Everything about TLS, connection pooling, and wire transport is the
/// caller's concern; the broker only classifies the response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, BrokerError>;
}
