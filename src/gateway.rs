//! Remote Data Gateway.
//!
//! Every backend call made by the client goes through `Gateway::call`: it
//! attaches the bearer token, applies the request timeout, performs the
//! single refresh-and-retry on 401/403, and turns every failure into a
//! `RequestFailed` instead of a panic or a half-decoded value.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::RequestFailed;
use crate::session::SessionManager;
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Method and body of a gateway call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub method: Method,
    pub body: Option<Value>,
}

impl CallOptions {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: None,
        }
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
        }
    }

    pub fn put(body: Value) -> Self {
        Self {
            method: Method::PUT,
            body: Some(body),
        }
    }

    pub fn delete() -> Self {
        Self {
            method: Method::DELETE,
            body: None,
        }
    }
}

pub struct Gateway {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
}

impl Gateway {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn Transport>,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            config,
            transport,
            session,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    async fn send(
        &self,
        url: &str,
        options: &CallOptions,
        token: Option<String>,
    ) -> Result<HttpResponse, RequestFailed> {
        let request = HttpRequest::new(options.method.clone(), url, self.config.request_timeout)
            .with_bearer(token)
            .with_body(options.body.clone());
        self.transport.send(request).await
    }

    /// Perform an authenticated call.
    ///
    /// `path` is relative to the configured base URL (leading slash
    /// optional) or an absolute URL. A 401/403 triggers one shared token
    /// refresh and one retry; if that is not enough the session is ended.
    pub async fn call(&self, path: &str, options: CallOptions) -> Result<Value, RequestFailed> {
        let url = self.config.resolve(path);
        let token = self.session.access_token().map(|t| t.as_str().to_string());

        let mut resp = self
            .send(&url, &options, token.clone())
            .await
            .inspect_err(|e| warn!(%url, error = %e, "request failed"))?;

        if resp.is_auth_failure() {
            debug!(%url, status = resp.status, "request rejected, refreshing token");
            let fresh = self
                .session
                .refresh_after_rejection(token.as_deref())
                .await
                .map_err(|e| RequestFailed::Unauthorized(e.to_string()))?;

            resp = self
                .send(&url, &options, Some(fresh.as_str().to_string()))
                .await
                .inspect_err(|e| warn!(%url, error = %e, "retry failed"))?;

            if resp.is_auth_failure() {
                self.session
                    .force_logout("request still rejected after token refresh");
                return Err(RequestFailed::Unauthorized(format!(
                    "HTTP {} after refresh",
                    resp.status
                )));
            }
        }

        decode_response(&url, resp)
    }

    /// Legacy form of `call`: any failure becomes an empty JSON array.
    /// An empty array is therefore ambiguous between "no data" and "failed".
    pub async fn call_or_empty(&self, path: &str, options: CallOptions) -> Value {
        self.call(path, options)
            .await
            .unwrap_or_else(|_| Value::Array(Vec::new()))
    }

    /// Call an endpoint that answers with a single record. Only a JSON
    /// object counts as success; an array is treated as a failure sentinel.
    pub async fn fetch_record<T: DeserializeOwned>(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<T, RequestFailed> {
        let value = self.call(path, options).await?;
        if !value.is_object() {
            warn!(path, "expected a record, got {}", shape_of(&value));
            return Err(RequestFailed::UnexpectedShape(format!(
                "expected an object, got {}",
                shape_of(&value)
            )));
        }
        serde_json::from_value(value).map_err(|e| RequestFailed::Malformed(e.to_string()))
    }

    /// GET an endpoint that answers with a list. Entries that fail to
    /// decode are skipped.
    pub async fn fetch_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, RequestFailed> {
        match self.call(path, CallOptions::get()).await? {
            Value::Array(entries) => Ok(decode_entries(path, entries)),
            other => Err(RequestFailed::UnexpectedShape(format!(
                "expected an array, got {}",
                shape_of(&other)
            ))),
        }
    }
}

pub(crate) fn decode_entries<T: DeserializeOwned>(path: &str, entries: Vec<Value>) -> Vec<T> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<T>(entry) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(path, error = %e, "skipping undecodable entry");
                None
            }
        })
        .collect()
}

fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Turn a raw response into JSON, or the reason it is unusable.
fn decode_response(url: &str, resp: HttpResponse) -> Result<Value, RequestFailed> {
    if !resp.is_success() {
        let message = serde_json::from_str::<Value>(&resp.body)
            .ok()
            .and_then(|json| {
                json.get("message")
                    .or_else(|| json.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| resp.body.trim().chars().take(200).collect());
        warn!(%url, status = resp.status, %message, "backend returned an error");
        return Err(RequestFailed::Status {
            status: resp.status,
            message,
        });
    }

    if resp.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    if !resp.is_json() {
        let content_type = resp.content_type.unwrap_or_else(|| "none".into());
        warn!(%url, %content_type, "non-JSON response");
        return Err(RequestFailed::NotJson(content_type));
    }
    serde_json::from_str(&resp.body).map_err(|e| {
        warn!(%url, error = %e, "invalid JSON response");
        RequestFailed::Malformed(e.to_string())
    })
}
