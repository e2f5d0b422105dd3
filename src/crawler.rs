//! The headless-browser crawler singleton.
//!
//! `Crawler` is the tested seam: `handle_web` (see `web.rs`) is written
//! entirely against the trait, so it can be exercised with a fake in tests
//! without launching a real browser. `ChromiumCrawler` is the concrete,
//! `chromiumoxide`-backed implementation used in production.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

/// Per-call crawl configuration (spec.md §4.D "Crawler configuration").
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub cache_enabled: bool,
    pub exclude_external_links: bool,
    pub use_llm_filter: bool,
    pub check_robots_txt: bool,
    pub page_timeout_ms: u64,
}

/// A link discovered on the page by the crawler's own extraction pass,
/// distinct from the regex-based extraction `web.rs` performs over raw
/// markdown (spec.md §4.D folds both sources together).
#[derive(Debug, Clone)]
pub struct InternalLink {
    pub href: String,
}

/// The result of one `fetch` attempt.
#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    pub success: bool,
    pub error_message: Option<String>,
    pub final_url: Option<String>,
    pub raw_markdown: String,
    /// Present only when an LLM/pruning content filter ran.
    pub fit_markdown: Option<String>,
    pub internal_links: Vec<InternalLink>,
}

#[async_trait]
pub trait Crawler: Send + Sync {
    async fn fetch(&self, url: &Url, config: &CrawlConfig) -> CrawlOutcome;

    /// Best-effort close; errors are logged, never propagated (spec.md §4.F).
    async fn close(&self);
}

/// `chromiumoxide`-backed crawler. One browser process per worker, launched
/// lazily and torn down / relaunched by [`CrawlerHandle`] on detected crash.
pub struct ChromiumCrawler {
    browser: Mutex<Browser>,
    _handler: tokio::task::JoinHandle<()>,
}

impl ChromiumCrawler {
    pub async fn launch() -> Result<Self> {
        let config = BrowserConfig::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch chromium browser")?;

        let task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!(error = %e, "chromium CDP handler error");
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(browser),
            _handler: task,
        })
    }
}

#[async_trait]
impl Crawler for ChromiumCrawler {
    async fn fetch(&self, url: &Url, config: &CrawlConfig) -> CrawlOutcome {
        let browser = self.browser.lock().await;

        let page = match browser.new_page(url.as_str()).await {
            Ok(p) => p,
            Err(e) => {
                return CrawlOutcome {
                    success: false,
                    error_message: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        if let Err(e) = page.wait_for_navigation().await {
            return CrawlOutcome {
                success: false,
                error_message: Some(e.to_string()),
                ..Default::default()
            };
        }

        let html = match page.content().await {
            Ok(h) => h,
            Err(e) => {
                return CrawlOutcome {
                    success: false,
                    error_message: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let final_url = page.url().await.ok().flatten();
        let _ = page.close().await;

        let raw_markdown = crate::markdown::html_to_raw_markdown(&html);
        // The default (pruning) generator runs here when the LLM filter is
        // bypassed or circuit-broken. When the LLM filter is in play, the
        // caller (`web.rs`) produces `fit_markdown` itself by calling the
        // LLM, since that call needs the per-task API key this trait doesn't
        // carry.
        let fit_markdown = if config.use_llm_filter {
            None
        } else {
            crate::markdown::prune_to_fit(&raw_markdown)
        };

        CrawlOutcome {
            success: true,
            error_message: None,
            final_url,
            raw_markdown,
            fit_markdown,
            internal_links: Vec::new(),
        }
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!(error = %e, "error closing chromium browser");
        }
        let _ = browser.wait().await;
    }
}

/// Process-wide crawler singleton with crash-recovery (spec.md §4.F).
///
/// `get_or_init` lazily launches the browser on first use. `restart` closes
/// the current instance (errors ignored) and launches a fresh one; `web.rs`
/// calls this after detecting a browser-crash-shaped error message.
pub struct CrawlerHandle {
    inner: Mutex<Option<Arc<dyn Crawler>>>,
}

impl CrawlerHandle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub async fn get_or_init(&self) -> Result<Arc<dyn Crawler>> {
        let mut guard = self.inner.lock().await;
        if let Some(c) = &*guard {
            return Ok(Arc::clone(c));
        }
        info!("initializing crawler singleton");
        let crawler: Arc<dyn Crawler> = Arc::new(ChromiumCrawler::launch().await?);
        *guard = Some(Arc::clone(&crawler));
        Ok(crawler)
    }

    pub async fn restart(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(old) = guard.take() {
            old.close().await;
        }
        match ChromiumCrawler::launch().await {
            Ok(fresh) => {
                info!("crawler restarted");
                *guard = Some(Arc::new(fresh));
            }
            Err(e) => {
                warn!(error = %e, "crawler restart failed; will retry lazily on next use");
            }
        }
    }

    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(c) = guard.take() {
            c.close().await;
        }
    }
}

impl Default for CrawlerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Substrings that indicate the browser process itself died mid-call rather
/// than a page-level failure; on a match the message loop restarts the
/// crawler singleton before propagating the error (spec.md §4.E step 5).
const CRASH_INDICATORS: &[&str] = &[
    "browser",
    "target closed",
    "session closed",
    "protocol error",
    "browser has been closed",
    "connection refused",
];

pub fn looks_like_crawler_crash(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CRASH_INDICATORS.iter().any(|needle| lower.contains(needle))
}
