//! HTTP transport seam.
//!
//! The gateway and session manager speak to the backend through the
//! `Transport` trait so the retry/refresh logic can be exercised without a
//! network. `ReqwestTransport` is the production implementation.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

use crate::error::RequestFailed;

/// A fully resolved request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub id: Uuid,
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            url: url.into(),
            bearer: None,
            body: None,
            timeout,
        }
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

/// Raw response; body decoding is the caller's business.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            content_type: Some("application/json; charset=utf-8".into()),
            body: body.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RequestFailed>;
}

// ---------------------------------------------------------------------------
// reqwest
// ---------------------------------------------------------------------------

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, RequestFailed> {
        let client = Client::builder()
            .build()
            .map_err(|e| RequestFailed::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

/// Convert a `reqwest::Error` into a readable failure.
fn friendly_error(url: &str, err: &reqwest::Error) -> RequestFailed {
    if err.is_timeout() {
        return RequestFailed::Timeout;
    }
    if err.is_connect() {
        return RequestFailed::Network(format!("Cannot reach backend at {url}"));
    }
    if err.is_builder() {
        return RequestFailed::Network(format!("Invalid backend URL: {url}"));
    }
    RequestFailed::Network(format!("Network error communicating with {url}: {err}"))
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RequestFailed> {
        trace!(request_id = %request.id, method = %request.method, url = %request.url, "sending");

        let mut req = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout)
            .header("X-Request-Id", request.id.to_string());
        if let Some(token) = request.bearer.as_deref() {
            req = req.bearer_auth(token);
        }
        if let Some(body) = request.body.as_ref() {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&request.url, &e))?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .text()
            .await
            .map_err(|e| friendly_error(&request.url, &e))?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_content_type_detection_is_case_insensitive() {
        let mut resp = HttpResponse::json(200, &json!({}));
        assert!(resp.is_json());
        resp.content_type = Some("Application/JSON".into());
        assert!(resp.is_json());
        resp.content_type = Some("text/html".into());
        assert!(!resp.is_json());
        resp.content_type = None;
        assert!(!resp.is_json());
    }

    #[test]
    fn auth_failure_covers_401_and_403_only() {
        assert!(HttpResponse::json(401, &json!({})).is_auth_failure());
        assert!(HttpResponse::json(403, &json!({})).is_auth_failure());
        assert!(!HttpResponse::json(404, &json!({})).is_auth_failure());
        assert!(!HttpResponse::json(500, &json!({})).is_auth_failure());
    }
}
