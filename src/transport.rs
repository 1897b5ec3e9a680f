use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Client, Method, Url};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const ERROR_BODY_MAX_CHARS: usize = 300;

/// Failure of a single REST call: either a non-2xx status or no response at all.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn details(&self) -> Value {
        serde_json::json!({ "status": self.status, "message": self.message })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value, TransportError>;
    async fn post(&self, path: &str, body: &Value) -> Result<Value, TransportError>;
    async fn put(&self, path: &str, body: &Value) -> Result<Value, TransportError>;
    async fn delete(&self, path: &str) -> Result<(), TransportError>;
}

/// Bearer credential handed to the transport when a session is connected.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    token: Option<String>,
}

impl Credential {
    pub fn bearer(token: Option<String>) -> Self {
        Self {
            token: token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.token.is_none()
    }

    fn header_value(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }
}

pub struct HttpTransport {
    base: Url,
    credential: Credential,
    http: Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, credential: Credential, timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut base = base_url.trim().to_string();
        // Url::join drops the last path segment unless the base ends with '/'.
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).with_context(|| format!("invalid API base URL: {base_url}"))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to construct reqwest client")?;
        Ok(Self {
            base,
            credential,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::unreachable(format!("invalid request path {path}: {e}")))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        let url = self.url(path)?;
        let mut req = self.http.request(method.clone(), url);
        if let Some(auth) = self.credential.header_value() {
            req = req.header(AUTHORIZATION, auth);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        tracing::debug!(%method, path, "api request");
        let response = req
            .send()
            .await
            .map_err(|e| TransportError::unreachable(format!("{method} {path} failed: {e}")))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| {
            TransportError::unreachable(format!(
                "failed to read response body (status {status}): {e}"
            ))
        })?;

        if !status.is_success() {
            return Err(TransportError::status(
                status.as_u16(),
                format!("{method} {path} returned {status}: {}", truncate_for_error(&text)),
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            TransportError::status(status.as_u16(), format!("invalid JSON from {path}: {e}"))
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<Value, TransportError> {
        self.send(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, TransportError> {
        self.send(Method::POST, path, Some(body)).await
    }

    async fn put(&self, path: &str, body: &Value) -> Result<Value, TransportError> {
        self.send(Method::PUT, path, Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<(), TransportError> {
        self.send(Method::DELETE, path, None).await.map(|_| ())
    }
}

fn truncate_for_error(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= ERROR_BODY_MAX_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(ERROR_BODY_MAX_CHARS).collect();
    out.push_str("...");
    out
}
