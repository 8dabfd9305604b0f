//! The live provider call.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::canonical::ProviderRequest;
use crate::provider::Provider;

/// Raw response from a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure to obtain any response from a provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("reading response from {url} failed: {message}")]
    Body { url: String, message: String },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Performs the live call for a request. Implementations are shared across
/// tasks and may be invoked concurrently for different requests.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(&self, request: &ProviderRequest) -> Result<UpstreamResponse, UpstreamError>;
}

// Set by the client itself or meaningless once the request is re-issued.
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "content-type"];

/// `reqwest`-backed upstream that POSTs the provider-native JSON body to
/// `<base url><endpoint>`, forwarding caller headers such as credentials.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    timeout: Duration,
    base_urls: BTreeMap<Provider, String>,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout,
            base_urls: BTreeMap::new(),
        })
    }

    /// Override the base URL for one provider.
    pub fn with_base_url(mut self, provider: Provider, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, base_url.into());
        self
    }

    pub fn base_url(&self, provider: Provider) -> &str {
        self.base_urls
            .get(&provider)
            .map_or(provider.rules().default_base_url, String::as_str)
    }

    fn url_for(&self, request: &ProviderRequest) -> String {
        format!(
            "{}{}",
            self.base_url(request.provider).trim_end_matches('/'),
            request.endpoint
        )
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(&self, request: &ProviderRequest) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.url_for(request);
        let body = serde_json::to_vec(&request.body)
            .map_err(|e| UpstreamError::Other(format!("failed to encode request body: {e}")))?;

        let mut builder = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in &request.headers {
            if SKIPPED_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        tracing::debug!(provider = %request.provider, url = %url, "calling upstream");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.timeout)
            } else {
                UpstreamError::Transport {
                    url: url.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.timeout)
            } else {
                UpstreamError::Body {
                    url: url.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        Ok(UpstreamResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
