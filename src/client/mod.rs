//! Resilient HTTP client for downstream collaborators.
//!
//! A [`ServiceClient`] talks to one base URL through a pooled `reqwest`
//! client. Every request goes through [`retry::with_retry`] with the
//! client's [`RetryPolicy`], carries a per-call timeout, and waits for one
//! of `max_connections` permits before it is sent.

pub mod collaborators;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use self::retry::{with_retry, RetryPolicy};
use crate::config::EndpointConfig;

/// Longest error body kept in a [`ServiceError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Failures surfaced by collaborator calls.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection refused or unreachable: {0}")]
    Unreachable(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response body: {0}")]
    Malformed(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
    #[error("client setup failed: {0}")]
    Build(String),
}

impl ServiceError {
    /// Timeouts, network failures and 5xx responses are worth another try;
    /// 4xx responses and undecodable bodies are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Timeout(_) | ServiceError::Unreachable(_) | ServiceError::Request(_) => true,
            ServiceError::Status { status, .. } => *status >= 500,
            ServiceError::Malformed(_) | ServiceError::InvalidUrl(_) | ServiceError::Build(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ServiceError::Timeout(error.to_string())
        } else if error.is_connect() {
            ServiceError::Unreachable(error.to_string())
        } else if error.is_decode() {
            ServiceError::Malformed(error.to_string())
        } else {
            ServiceError::Request(error.to_string())
        }
    }
}

/// Pooled, retrying client bound to one collaborator's base URL.
pub struct ServiceClient {
    name: String,
    base_url: Url,
    client: Client,
    timeout: Duration,
    health_timeout: Duration,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl ServiceClient {
    /// Build a client named `name` (used in logs) from endpoint settings.
    pub fn new(name: &str, endpoint: &EndpointConfig, retry: RetryPolicy) -> Result<Self, ServiceError> {
        let base_url = Url::parse(&endpoint.base_url)
            .map_err(|_| ServiceError::InvalidUrl(endpoint.base_url.clone()))?;

        let mut headers = HeaderMap::new();
        if let Some(key) = &endpoint.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| ServiceError::Build(format!("invalid api key header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(endpoint.timeout())
            .connect_timeout(endpoint.timeout().min(Duration::from_secs(5)))
            .pool_max_idle_per_host(endpoint.max_idle_connections)
            .pool_idle_timeout(Duration::from_secs(30))
            .default_headers(headers)
            .user_agent(concat!("alertpipe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ServiceError::Build(e.to_string()))?;

        debug!(
            service = name,
            base_url = %base_url,
            timeout_secs = endpoint.timeout_secs,
            max_connections = endpoint.max_connections,
            "service client ready"
        );

        Ok(Self {
            name: name.to_string(),
            base_url,
            client,
            timeout: endpoint.timeout(),
            health_timeout: endpoint.health_timeout(),
            retry,
            permits: Arc::new(Semaphore::new(endpoint.max_connections.max(1))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Join `path` onto the base URL, keeping any base path prefix.
    pub fn url(&self, path: &str) -> Result<Url, ServiceError> {
        let joined = format!("{}/{}", self.base_url(), path.trim_start_matches('/'));
        Url::parse(&joined).map_err(|_| ServiceError::InvalidUrl(joined))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        self.execute(Method::GET, path, None).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ServiceError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(|e| ServiceError::Request(e.to_string()))?;
        self.execute(Method::POST, path, Some(body)).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ServiceError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(|e| ServiceError::Request(e.to_string()))?;
        self.execute(Method::PUT, path, Some(body)).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ServiceError> {
        let url = self.url(path)?;
        let operation = format!("{} {} {}", self.name, method, path);
        with_retry(&self.retry, &operation, || {
            self.send_once(method.clone(), url.clone(), body.as_ref())
        })
        .await
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<T, ServiceError> {
        // Waits for a slot instead of failing when every connection is busy.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ServiceError::Request("connection pool closed".to_string()))?;

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(ServiceError::from_reqwest)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(ServiceError::from_reqwest)?;

        if !status.is_success() {
            let mut body = String::from_utf8_lossy(&bytes).into_owned();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| ServiceError::Malformed(e.to_string()))
    }

    /// `GET /health` with its own short timeout. Never errors.
    pub async fn health_check(&self) -> bool {
        let url = match self.url("/health") {
            Ok(url) => url,
            Err(_) => return false,
        };
        match self.client.get(url).timeout(self.health_timeout).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                warn!(service = %self.name, base_url = %self.base_url, error = %e, "health check failed");
                false
            }
        }
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        debug!(service = %self.name, "closing service client");
    }
}
