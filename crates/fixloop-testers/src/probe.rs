//! Page loading boundary

use async_trait::async_trait;
use std::time::Duration;

/// Result of loading one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLoad {
    /// Path requested
    pub path: String,
    /// HTTP status, or 0 when the request never completed
    pub status: u16,
    /// Response body (or transport error text)
    pub body: String,
    /// Wall time spent
    pub elapsed: Duration,
}

impl PageLoad {
    /// 2xx response
    #[must_use]
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Loads pages of the application under test
#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Load `path`; transport failures are reported as status 0, never as errors
    async fn load(&self, path: &str) -> PageLoad;
}

/// reqwest-backed probe rooted at a base URL
#[derive(Debug, Clone)]
pub struct HttpProbe {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    /// Probe for `base_url` with a per-request timeout
    ///
    /// # Errors
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl PageProbe for HttpProbe {
    async fn load(&self, path: &str) -> PageLoad {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let start = tokio::time::Instant::now();
        let (status, body) = match self.client.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                (status, resp.text().await.unwrap_or_default())
            }
            Err(e) => (0, e.to_string()),
        };
        let elapsed = start.elapsed();
        tracing::debug!(%url, status, elapsed_ms = elapsed.as_millis() as u64, "page loaded");
        PageLoad {
            path: path.to_string(),
            status,
            body,
            elapsed,
        }
    }
}
