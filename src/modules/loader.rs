//! Cache-first file loading with network fallback
//!
//! `load_file` consults the persistent cache first (unless bypassed), then
//! fetches over the network and, when caching, saves the body before
//! resolving so the cached copy is ground truth for the next caller.
//! `load_script`/`load_css` additionally hand the body to the page host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{FileCache, SaveAttribs};
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::modules::NocacheLists;
use crate::page::PageHost;

/// Network seam for module and file retrieval. Production uses
/// [`HttpFetcher`]; tests inject a counting mock.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// reqwest-backed fetcher. HTTP 429 is retried with capped linear backoff;
/// other failing statuses reject immediately.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_attempts: u32,
    backoff_step: Duration,
    backoff_cap: Duration,
}

impl HttpFetcher {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_attempts: config.fetch_max_attempts,
            backoff_step: config.fetch_backoff_step,
            backoff_cap: config.fetch_backoff_cap,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        (self.backoff_step * attempt).min(self.backoff_cap)
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        for attempt in 1..=self.max_attempts {
            let response = self.client.get(url).send().await.map_err(|e| {
                KernelError::FetchFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if attempt == self.max_attempts {
                    break;
                }
                let delay = self.backoff(attempt);
                debug!(url = url, attempt = attempt, delay_ms = delay.as_millis() as u64, "rate limited, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            if !status.is_success() {
                return Err(KernelError::FetchFailed {
                    url: url.to_string(),
                    reason: format!("HTTP {status}"),
                });
            }
            return response
                .text()
                .await
                .map_err(|e| KernelError::FetchFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
        }
        Err(KernelError::FetchFailed {
            url: url.to_string(),
            reason: "rate limited: retry budget exhausted".to_string(),
        })
    }
}

/// The file-loading collaborator used by the inclusion sequencer.
pub struct FileLoader {
    cache: Arc<FileCache>,
    fetcher: Arc<dyn ResourceFetcher>,
    page: Arc<dyn PageHost>,
    nocache: Arc<NocacheLists>,
}

impl FileLoader {
    pub fn new(
        cache: Arc<FileCache>,
        fetcher: Arc<dyn ResourceFetcher>,
        page: Arc<dyn PageHost>,
        nocache: Arc<NocacheLists>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            page,
            nocache,
        }
    }

    /// Load a file, preferring the cache. The raw-file bypass list (exact
    /// URL or `"*"`) forces a network fetch without caching.
    pub async fn load_file(&self, url: &str, use_cache: bool) -> Result<Value> {
        let use_cache = use_cache && !self.nocache.bypass_file(url);

        if use_cache {
            match self.cache.load(url).await {
                Ok(content) => return Ok(content),
                Err(e) => debug!(url = url, error = %e, "cache miss, fetching"),
            }
        }

        let body = self.fetcher.fetch(url).await?;
        let content = Value::String(body);
        if use_cache {
            if let Err(e) = self
                .cache
                .save(url, &content, SaveAttribs::default())
                .await
            {
                warn!(url = url, error = %e, "could not cache fetched file");
            }
        }
        Ok(content)
    }

    /// Load a script body and install it into the page. Resolves with the URL.
    pub async fn load_script(&self, url: &str, use_cache: bool) -> Result<String> {
        let content = self.load_file(url, use_cache).await?;
        self.page.append_script(url, &as_text(&content));
        Ok(url.to_string())
    }

    /// Load a stylesheet and install it into the page. Resolves with the URL.
    pub async fn load_css(&self, url: &str, use_cache: bool) -> Result<String> {
        let content = self.load_file(url, use_cache).await?;
        self.page.append_css(url, &as_text(&content));
        Ok(url.to_string())
    }
}

fn as_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::store::StoreManager;
    use crate::testing::{CountingFetcher, FakePage};
    use tempfile::TempDir;

    fn loader_at(temp: &TempDir, fetcher: Arc<CountingFetcher>) -> (FileLoader, Arc<FakePage>) {
        let config = Arc::new(KernelConfig {
            db_path: temp.path().join("files.sled"),
            ..KernelConfig::default()
        });
        let cache = Arc::new(FileCache::new(StoreManager::new(config.clone()), config));
        let page = Arc::new(FakePage::new());
        let loader = FileLoader::new(
            cache,
            fetcher,
            page.clone(),
            Arc::new(NocacheLists::new()),
        );
        (loader, page)
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::ok("body"));
        let (loader, _page) = loader_at(&temp, fetcher.clone());

        loader.load_file("https://x/script.js", true).await.unwrap();
        assert_eq!(fetcher.count(), 1);

        // Second load served from the cache.
        let content = loader.load_file("https://x/script.js", true).await.unwrap();
        assert_eq!(content, Value::String("body".to_string()));
        assert_eq!(fetcher.count(), 1);
    }

    #[tokio::test]
    async fn test_bypass_list_forces_fetch() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::ok("body"));
        let (loader, _page) = loader_at(&temp, fetcher.clone());
        loader.nocache.set_files(["*"]);

        loader.load_file("https://x/a.js", true).await.unwrap();
        loader.load_file("https://x/a.js", true).await.unwrap();
        assert_eq!(fetcher.count(), 2);
    }

    #[tokio::test]
    async fn test_load_script_installs_into_page() {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher::ok("console.log(1)"));
        let (loader, page) = loader_at(&temp, fetcher);

        let url = loader
            .load_script("https://x/mod.js", true)
            .await
            .unwrap();
        assert_eq!(url, "https://x/mod.js");
        assert_eq!(
            page.installed_script("https://x/mod.js").as_deref(),
            Some("console.log(1)")
        );
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let fetcher = HttpFetcher::new(&KernelConfig::default());
        assert_eq!(fetcher.backoff(1), Duration::from_millis(500));
        assert_eq!(fetcher.backoff(4), Duration::from_secs(2));
        assert_eq!(fetcher.backoff(40), Duration::from_secs(5));
    }
}
