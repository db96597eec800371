//! Azure DevOps REST client.
//!
//! Builds URLs, attaches the Basic auth header, maps HTTP statuses onto the
//! [`ConnectorError`] taxonomy, and applies the shared [`RetryPolicy`] and
//! [`RequestBudget`] to every request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::credentials::AccessToken;
use crate::error::{ConnectorError, Result};
use crate::http::{HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::rate_limit::RequestBudget;
use crate::retry::RetryPolicy;

/// Header carrying the continuation token on paged GET listings.
pub const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

/// Which Azure DevOps service host an endpoint lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiHost {
    /// `dev.azure.com`: work items, git, test, wiki.
    Core,
    /// `vsrm.dev.azure.com`: release management.
    Release,
}

/// Connection parameters for a [`DevOpsClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub release_base_url: String,
    pub organization: String,
    pub project: String,
    pub api_version: String,
}

/// A request relative to the project: `{host}/{org}/{project}/_apis/{path}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub host: ApiHost,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            host: ApiHost::Core,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            host: ApiHost::Core,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn on(mut self, host: ApiHost) -> Self {
        self.host = host;
        self
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Add a query parameter only when `value` is present.
    pub fn query_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.query(key, v),
            None => self,
        }
    }

    /// Short label for logs and error messages.
    pub fn operation(&self) -> String {
        format!("{} {}", self.method.as_str(), self.path)
    }
}

/// Decoded response body plus the headers the paginator needs.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub url: String,
    pub body: serde_json::Value,
    pub continuation_header: Option<String>,
}

impl ApiResponse {
    /// Continuation token from the header, falling back to the
    /// `continuationToken` body field used by POST queries.
    pub fn continuation_token(&self) -> Option<String> {
        self.continuation_header
            .clone()
            .or_else(|| {
                self.body
                    .get("continuationToken")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .filter(|t| !t.is_empty())
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(self.body).map_err(|e| ConnectorError::Decode {
            url: self.url,
            message: e.to_string(),
        })
    }

    /// Items of a `{ "count": n, "value": [...] }` envelope.
    pub fn value_array(&self) -> Vec<serde_json::Value> {
        self.body
            .get("value")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }
}

/// Client for one organization/project pair.
#[derive(Clone)]
pub struct DevOpsClient {
    transport: Arc<dyn HttpTransport>,
    token: AccessToken,
    options: ClientOptions,
    retry: RetryPolicy,
    budget: Arc<RequestBudget>,
}

impl DevOpsClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        token: AccessToken,
        options: ClientOptions,
        retry: RetryPolicy,
        budget: Arc<RequestBudget>,
    ) -> Self {
        Self {
            transport,
            token,
            options,
            retry,
            budget,
        }
    }

    pub fn organization(&self) -> &str {
        &self.options.organization
    }

    pub fn project(&self) -> &str {
        &self.options.project
    }

    pub fn budget(&self) -> &RequestBudget {
        &self.budget
    }

    /// Browser link into the project, e.g. `_workitems/edit/42`.
    pub fn web_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.options.base_url.trim_end_matches('/'),
            self.options.organization,
            self.options.project,
            path.trim_start_matches('/')
        )
    }

    /// Fully-qualified URL for `request`, including `api-version` unless the
    /// request sets its own.
    pub fn build_url(&self, request: &ApiRequest) -> Result<String> {
        let base = match request.host {
            ApiHost::Core => &self.options.base_url,
            ApiHost::Release => &self.options.release_base_url,
        };
        let mut url = Url::parse(base).map_err(|e| {
            ConnectorError::configuration(format!("invalid base url '{}': {}", base, e))
        })?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ConnectorError::configuration(format!("base url '{}' cannot carry a path", base))
            })?;
            segments.pop_if_empty();
            segments.push(&self.options.organization);
            segments.push(&self.options.project);
            segments.push("_apis");
            for part in request.path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        {
            let mut pairs = url.query_pairs_mut();
            if !request.query.iter().any(|(k, _)| k == "api-version") {
                pairs.append_pair("api-version", &self.options.api_version);
            }
            for (k, v) in &request.query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url.to_string())
    }

    /// Send `request` with retries, returning the decoded JSON body.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = self.build_url(request)?;
        let body = match &request.body {
            Some(v) => serde_json::to_vec(v).map_err(|e| ConnectorError::Decode {
                url: url.clone(),
                message: e.to_string(),
            })?,
            None => Vec::new(),
        };
        let operation = request.operation();

        self.retry
            .run(&operation, |attempt| {
                let url = url.clone();
                let http_request = HttpRequest {
                    method: request.method,
                    url: url.clone(),
                    headers: self.headers(request.body.is_some()),
                    body: body.clone(),
                };
                async move {
                    let _guard = self.budget.acquire().await?;
                    debug!(method = request.method.as_str(), url = %http_request.url, attempt, "sending request");
                    let response = self
                        .transport
                        .send(http_request)
                        .await
                        .map_err(|e| map_transport_error(&url, e))?;
                    self.interpret(&url, response)
                }
            })
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        self.send(request).await?.decode()
    }

    fn headers(&self, has_body: bool) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Authorization".to_string(), self.token.basic_auth_header()),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        if has_body {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        headers
    }

    fn interpret(&self, url: &str, response: HttpResponse) -> Result<ApiResponse> {
        let status = response.status;
        if (200..300).contains(&status) {
            let body = if response.body.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&response.body).map_err(|e| ConnectorError::Decode {
                    url: url.to_string(),
                    message: e.to_string(),
                })?
            };
            return Ok(ApiResponse {
                url: url.to_string(),
                body,
                continuation_header: response.header(CONTINUATION_HEADER).map(str::to_string),
            });
        }

        let retry_after = parse_retry_after(&response);
        // Other callers wait through the shared budget; hold them no longer
        // than the retry policy would.
        let pause = self.retry.delay_for(0, retry_after);
        match status {
            401 | 403 => Err(ConnectorError::credential(format!(
                "HTTP {} from {}",
                status, url
            ))),
            404 => Err(ConnectorError::NotFound(url.to_string())),
            429 => {
                self.budget.note_throttled(pause);
                Err(ConnectorError::Transient {
                    message: format!("rate limited (HTTP 429) by {}", url),
                    retry_after,
                })
            }
            408 | 500..=599 => {
                if status == 503 && retry_after.is_some() {
                    self.budget.note_throttled(pause);
                }
                Err(ConnectorError::Transient {
                    message: format!("HTTP {} from {}", status, url),
                    retry_after,
                })
            }
            _ => Err(ConnectorError::Http {
                status,
                url: url.to_string(),
                body: String::from_utf8_lossy(&response.body)
                    .chars()
                    .take(512)
                    .collect(),
            }),
        }
    }
}

fn map_transport_error(url: &str, error: HttpError) -> ConnectorError {
    match error {
        HttpError::Timeout(_) | HttpError::Transport(_) => {
            ConnectorError::transient(format!("{} ({})", error, url))
        }
        HttpError::NoMockResponse { .. } => ConnectorError::Http {
            status: 0,
            url: url.to_string(),
            body: error.to_string(),
        },
    }
}

/// `Retry-After` as delta-seconds or an HTTP date; falls back to the
/// `X-RateLimit-Delay` hint. Values too large for a [`Duration`] saturate.
fn parse_retry_after(response: &HttpResponse) -> Option<Duration> {
    if let Some(value) = response.header("retry-after") {
        let value = value.trim();
        if let Some(delay) = seconds(value) {
            return Some(delay);
        }
        if let Ok(at) = DateTime::parse_from_rfc2822(value) {
            let delta = at.with_timezone(&Utc) - Utc::now();
            return Some(delta.to_std().unwrap_or(Duration::ZERO));
        }
    }
    response.header("x-ratelimit-delay").and_then(|v| seconds(v.trim()))
}

fn seconds(value: &str) -> Option<Duration> {
    let secs = value.parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::http::MockTransport;

    pub fn options() -> ClientOptions {
        ClientOptions {
            base_url: "https://dev.azure.com".to_string(),
            release_base_url: "https://vsrm.dev.azure.com".to_string(),
            organization: "org".to_string(),
            project: "proj".to_string(),
            api_version: "7.0".to_string(),
        }
    }

    /// Client over a mock transport with immediate retries.
    pub fn client(transport: &MockTransport) -> DevOpsClient {
        DevOpsClient::new(
            Arc::new(transport.clone()),
            AccessToken::new("test-pat"),
            options(),
            RetryPolicy::immediate(4),
            Arc::new(RequestBudget::new(4)),
        )
    }
}
