//! HTTP calls against the proxy (impure I/O)

use crate::config::{ConfigError, ProxySection};
use crate::error::{GateError, GateResult};
use crate::protocol::{ProxyPublishRequest, ProxyStatusResponse};
use crate::resilience::RequestCache;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of a status fetch, with how long the request took
#[derive(Debug, Clone)]
pub struct FetchedStatus {
    pub response: ProxyStatusResponse,
    /// `None` when served from the request cache
    pub elapsed: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ProxyHttpClient {
    client: Client,
    base_url: String,
    status_url: String,
    publish_url: String,
    timeout: Duration,
    cache: RequestCache<ProxyStatusResponse>,
}

impl ProxyHttpClient {
    pub fn new(config: &ProxySection) -> GateResult<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            ConfigError::InvalidConfig("proxy.base_url is required".to_string())
        })?;
        url::Url::parse(base_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("proxy.base_url '{base_url}' is invalid: {e}"))
        })?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gatelink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GateError::transient(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            status_url: join_path(&base_url, &config.status_path),
            publish_url: join_path(&base_url, &config.publish_path),
            base_url,
            timeout,
            cache: RequestCache::new(Duration::from_millis(config.cache_ttl_ms)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn classify(&self, operation: &str, err: reqwest::Error) -> GateError {
        if err.is_timeout() {
            GateError::request_timeout(operation, self.timeout.as_millis() as u64)
        } else {
            GateError::from(err)
        }
    }

    /// GET the proxy status. With `use_cache`, a response younger than the
    /// cache TTL is returned without a request.
    pub async fn fetch_status(&self, use_cache: bool) -> GateResult<FetchedStatus> {
        if use_cache {
            if let Some(response) = self.cache.get(&self.status_url).await {
                debug!(url = %self.status_url, "Using cached proxy status");
                return Ok(FetchedStatus {
                    response,
                    elapsed: None,
                });
            }
        }

        let started = Instant::now();
        let response = self
            .client
            .get(&self.status_url)
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(|e| self.classify("Proxy status request", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Proxy status request rejected");
            return Err(GateError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: ProxyStatusResponse = response
            .json()
            .await
            .map_err(|e| self.classify("Proxy status request", e))?;
        let elapsed = started.elapsed();

        self.cache.insert(self.status_url.clone(), parsed.clone()).await;
        Ok(FetchedStatus {
            response: parsed,
            elapsed: Some(elapsed),
        })
    }

    /// POST a command; returns the request duration
    pub async fn publish(&self, request: &ProxyPublishRequest) -> GateResult<Duration> {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.publish_url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify("Proxy publish request", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GateError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(started.elapsed())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

fn join_path(base_url: &str, path: &str) -> String {
    if path.is_empty() {
        return base_url.to_string();
    }
    format!("{base_url}/{}", path.trim_start_matches('/'))
}
