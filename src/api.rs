//! HTTP client for the ChatEm backend
//!
//! Prepends the base URL, injects the bearer token, encodes bodies as JSON and
//! turns every failure into a [`ChatEmError`] variant.

use crate::error::ChatEmError;
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

/// Per-request options, mirroring what callers send in `FETCH_FROM_API`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl RequestOptions {
    pub fn post(body: Value) -> Self {
        Self {
            method: Some("POST".to_string()),
            body: Some(body),
            ..Self::default()
        }
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: RwLock<String>,
    token: RwLock<Option<String>>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: RwLock::new(base_url.trim_end_matches('/').to_string()),
            token: RwLock::new(None),
            timeout,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.read().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn set_base_url(&self, url: &str) {
        if let Ok(mut base) = self.base_url.write() {
            *base = url.trim_end_matches('/').to_string();
        }
    }

    pub fn auth_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    /// `None` removes the token
    pub fn set_auth_token(&self, token: Option<String>) {
        if let Ok(mut current) = self.token.write() {
            *current = token.filter(|t| !t.is_empty());
        }
    }

    fn url_for(&self, endpoint: &str) -> String {
        let base = self.base_url();
        if endpoint.is_empty() {
            base
        } else if endpoint.starts_with('/') {
            format!("{}{}", base, endpoint)
        } else {
            format!("{}/{}", base, endpoint)
        }
    }

    fn build_headers(&self, overrides: &BTreeMap<String, String>) -> Result<HeaderMap, ChatEmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = self.auth_token() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ChatEmError::Validation(format!("Invalid auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        // Caller headers win, including Authorization
        for (name, value) in overrides {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ChatEmError::Validation(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ChatEmError::Validation(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Sends one request and returns the parsed JSON body, or `None` for an
    /// empty 2xx body.
    pub async fn request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Option<Value>, ChatEmError> {
        let url = self.url_for(endpoint);
        let method = match options.method.as_deref() {
            None => Method::GET,
            Some(m) => Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                .map_err(|_| ChatEmError::Validation(format!("Invalid HTTP method: {}", m)))?,
        };
        let headers = self.build_headers(&options.headers)?;

        let mut builder = self.http.request(method.clone(), &url).headers(headers);
        if let Some(body) = &options.body {
            let encoded =
                serde_json::to_vec(body).map_err(|e| ChatEmError::serialization(endpoint, e))?;
            builder = builder.body(encoded);
        }

        debug!("[api] {} {}", method, url);

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let (status, text) = match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => {
                warn!("[api] {} {} timed out after {:?}", method, url, self.timeout);
                return Err(ChatEmError::Timeout(self.timeout));
            }
            Ok(Err(e)) if e.is_timeout() => return Err(ChatEmError::Timeout(self.timeout)),
            Ok(Err(e)) => {
                warn!("[api] {} {} failed: {}", method, url, e);
                return Err(ChatEmError::Network(format!("Failed to reach {}: {}", url, e)));
            }
            Ok(Ok(exchange)) => exchange,
        };

        if !status.is_success() {
            let message = error_message(status, &text);
            warn!("[api] {} {} -> {}: {}", method, url, status.as_u16(), message);
            return Err(ChatEmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ChatEmError::Serialization {
                key: endpoint.to_string(),
                message: format!("Response was not valid JSON: {}", e),
                raw: Some(text),
            })
    }

    /// Logs in and adopts the returned token when it is a non-empty string
    pub async fn login(&self, credentials: Value) -> Result<Option<Value>, ChatEmError> {
        let response = self
            .request("/auth/login", RequestOptions::post(credentials))
            .await?;

        match response
            .as_ref()
            .and_then(|r| r.get("token"))
            .and_then(Value::as_str)
        {
            Some(token) if !token.is_empty() => {
                self.set_auth_token(Some(token.to_string()));
                info!("[api] Login succeeded, token updated");
            }
            _ => warn!("[api] Login response did not contain a valid token"),
        }
        Ok(response)
    }

    pub async fn register(&self, user: Value) -> Result<Option<Value>, ChatEmError> {
        self.request("/auth/register", RequestOptions::post(user)).await
    }

    /// Posts a message to a conversation, or to `/messages` when there is none yet
    pub async fn send_message(
        &self,
        conversation_id: Option<&str>,
        message: Value,
    ) -> Result<Option<Value>, ChatEmError> {
        let endpoint = match conversation_id {
            Some(id) => format!("/conversations/{}/messages", urlencoding::encode(id)),
            None => "/messages".to_string(),
        };
        self.request(&endpoint, RequestOptions::post(message)).await
    }

    pub async fn get_conversations(&self, user_id: &str) -> Result<Option<Value>, ChatEmError> {
        let user_id = require_id(user_id, "User ID is required to get conversations")?;
        self.request(
            &format!("/users/{}/conversations", urlencoding::encode(user_id)),
            RequestOptions::default(),
        )
        .await
    }

    pub async fn get_user_info(&self, user_id: &str) -> Result<Option<Value>, ChatEmError> {
        let user_id = require_id(user_id, "User ID is required to get user info")?;
        self.request(
            &format!("/users/{}", urlencoding::encode(user_id)),
            RequestOptions::default(),
        )
        .await
    }
}

fn require_id<'a>(id: &'a str, message: &str) -> Result<&'a str, ChatEmError> {
    let id = id.trim();
    if id.is_empty() {
        Err(ChatEmError::Validation(message.to_string()))
    } else {
        Ok(id)
    }
}

/// `message` from a JSON error body, else the status line text
fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown API error")
                .to_string()
        })
}
