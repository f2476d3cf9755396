//! REST fetchers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value as JsonValue;
use tracing::debug;

use chatline_core::{ConfigError, FetchError};

use crate::config::ClientConfig;

/// Remote source of JSON documents, addressed by path and query pairs.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError>;
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    auth_headers: HeaderMap,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.auth_headers.contains_key(AUTHORIZATION))
            .finish()
    }
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ConfigError::invalid("request_timeout_ms", err.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_headers: build_auth_headers(config.auth.bearer_token.as_deref())?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn build_auth_headers(bearer_token: Option<&str>) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    if let Some(token) = bearer_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ConfigError::invalid("auth.bearer_token", err.to_string()))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

#[async_trait]
impl JsonSource for RestClient {
    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError> {
        let url = self.url_for(path);
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers.clone())
            .query(query)
            .send()
            .await
            .map_err(FetchError::remote)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response.json::<JsonValue>().await.map_err(|err| FetchError::Decode {
            reason: err.to_string(),
        })
    }
}
