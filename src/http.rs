use std::time::Duration;

use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::Config;
use crate::error::{AppError, AppResult};

/// Bodies larger than this are dropped from error messages; the status alone
/// is more useful than a truncated HTML page.
const ERROR_BODY_LIMIT: usize = 200;

/// Which of the two remote endpoints a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiTarget {
    /// The primary sandbox API.
    Api,
    /// The git hub (Gitea-side) API.
    Hub,
}

/// Authenticated JSON client for the sandbox and hub APIs. No retries happen
/// at this layer; callers decide per operation.
#[derive(Clone)]
pub struct ApiClient {
    api_base: String,
    hub_base: String,
    api_key: String,
    client: Client,
}

impl ApiClient {
    pub fn new(config: &Config) -> Self {
        Self {
            api_base: config.api_base_url.trim_end_matches('/').to_string(),
            hub_base: config.hub_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("client build"),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    fn base(&self, target: ApiTarget) -> &str {
        match target {
            ApiTarget::Api => &self.api_base,
            ApiTarget::Hub => &self.hub_base,
        }
    }

    pub(crate) async fn send(
        &self,
        target: ApiTarget,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> AppResult<Response> {
        let url = format!("{}{}", self.base(target), path);
        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key);
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(resp)
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        target: ApiTarget,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> AppResult<T> {
        let resp = self.send(target, method, path, body, None).await?;
        Ok(resp.json().await?)
    }

    pub async fn request_unit(
        &self,
        target: ApiTarget,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> AppResult<()> {
        self.send(target, method, path, body, None).await?;
        Ok(())
    }

    /// Open a streaming GET. The per-request timeout is widened past the
    /// caller's wall clock so the body read is never cut short by the
    /// client-level default; the caller enforces its own deadline.
    pub(crate) async fn get_stream(
        &self,
        target: ApiTarget,
        path: &str,
        wall_clock: Duration,
    ) -> AppResult<Response> {
        self.send(
            target,
            Method::GET,
            path,
            None,
            Some(wall_clock + Duration::from_secs(5)),
        )
        .await
    }
}

/// Extract a useful message from a non-2xx response: prefer the structured
/// `error`/`message`/`detail` fields, fall back to a short raw body, then to
/// the status alone.
async fn error_from_response(resp: Response) -> AppError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();

    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        for key in ["error", "message", "detail"] {
            if let Some(message) = value.get(key).and_then(|v| v.as_str()) {
                return AppError::Remote {
                    status,
                    message: message.to_string(),
                };
            }
        }
    }

    let message = if body.is_empty() || body.len() > ERROR_BODY_LIMIT {
        format!("HTTP {status}")
    } else {
        body
    };
    AppError::Remote { status, message }
}
