//! Web handler: `handle_web` (spec.md §4.D).

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::config::Config;
use crate::crawler::{CrawlConfig, Crawler};
use crate::error::{classify, ErrorKind, IngestError};
use crate::llm::{LlmCircuit, LlmFilterConfig};
use crate::markdown;
use crate::sitemap;
use crate::task::{ApiKey, ContentRecord, Metadata};
use crate::util::same_site;

const CRAWL_MAX_RETRIES: u32 = 2;
const CRAWL_INITIAL_BACKOFF_S: u64 = 2;

/// True when the LLM filter must not even be attempted for this URL
/// (plain-text / `llms.txt` documents are already filter-friendly).
fn bypasses_llm_filter(url: &Url) -> bool {
    let path = url.path();
    path.ends_with(".txt") || path.ends_with("llms.txt")
}

pub async fn handle_web(
    url_str: &str,
    api_key: Option<&ApiKey>,
    crawler: &dyn Crawler,
    http_client: &reqwest::Client,
    config: &Config,
    circuit: &LlmCircuit,
) -> Result<Vec<ContentRecord>, IngestError> {
    let url = Url::parse(url_str)
        .map_err(|e| IngestError::new(ErrorKind::InvalidFormat, format!("invalid URL {url_str}: {e}")))?;

    let use_llm = !bypasses_llm_filter(&url) && !circuit.is_open() && api_key.is_some() && !api_key.map(ApiKey::is_empty).unwrap_or(true);

    let crawl_config = CrawlConfig {
        cache_enabled: true,
        exclude_external_links: true,
        use_llm_filter: use_llm,
        check_robots_txt: true,
        page_timeout_ms: config.crawler_page_timeout_ms,
    };

    let outcome = crawl_with_retries(crawler, &url, &crawl_config, config).await?;

    // When the LLM filter is in play, it *is* the generator that produces
    // `fit_markdown`; otherwise the crawler already ran the default pruning
    // generator and `outcome.fit_markdown` carries its output.
    let fit_markdown = if use_llm {
        let llm_output = match api_key {
            Some(llm_api_key) => crate::llm::filter_content(http_client, llm_api_key, &LlmFilterConfig::default(), &outcome.raw_markdown).await,
            None => None,
        };
        circuit.record(llm_output.as_deref());
        llm_output
    } else {
        outcome.fit_markdown.clone()
    };

    // spec.md §4.D: content = fit_markdown if non-empty after trim, else
    // raw_markdown, else "".
    let content = fit_markdown
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| outcome.raw_markdown.clone());

    let mut links: BTreeSet<String> = markdown::link_targets(&outcome.raw_markdown)
        .into_iter()
        .filter_map(|href| resolve_same_site_link(&url, &href))
        .collect();

    for l in &outcome.internal_links {
        if let Some(resolved) = resolve_same_site_link(&url, &l.href) {
            links.insert(resolved);
        }
    }

    let title = markdown::first_h1_title(&outcome.raw_markdown);
    let path = join_path_segments(&url);

    if url.path().is_empty() || url.path() == "/" {
        let sitemap_urls = sitemap::fetch_sitemap(&url).await;
        for u in sitemap_urls {
            links.insert(u.to_string());
        }
    }

    Ok(vec![ContentRecord {
        url: url.to_string(),
        path,
        title,
        content,
        links,
        metadata: Metadata::default(),
    }])
}

fn resolve_same_site_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let resolved = if let Ok(u) = Url::parse(href) {
        u
    } else {
        base.join(href).ok()?
    };
    if same_site(base, &resolved) {
        Some(resolved.to_string())
    } else {
        None
    }
}

fn join_path_segments(url: &Url) -> String {
    url.path_segments()
        .map(|segs| {
            segs.filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" > ")
        })
        .unwrap_or_default()
}

/// The `_crawl_single` per-attempt protocol plus the outer retry loop
/// (spec.md §4.D "Per-attempt protocol" and "Retry loop").
async fn crawl_with_retries(
    crawler: &dyn Crawler,
    url: &Url,
    crawl_config: &CrawlConfig,
    config: &Config,
) -> Result<crate::crawler::CrawlOutcome, IngestError> {
    let deadline = config.crawl_outer_deadline();
    let mut last_error: Option<IngestError> = None;

    for attempt in 1..=(CRAWL_MAX_RETRIES + 1) {
        let result = tokio::time::timeout(deadline, crawler.fetch(url, crawl_config)).await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = IngestError::new(ErrorKind::CrawlTimeout, format!("crawl deadline of {deadline:?} exceeded"));
                if attempt <= CRAWL_MAX_RETRIES {
                    sleep_backoff(attempt).await;
                    last_error = Some(err);
                    continue;
                }
                return Err(err);
            }
        };

        if !outcome.success {
            let message = outcome.error_message.unwrap_or_default();
            let err = classify(&message);
            if !err.is_transient() {
                return Err(err);
            }
            if attempt <= CRAWL_MAX_RETRIES {
                warn!(attempt, error = %err.message, "transient crawl failure, retrying");
                sleep_backoff(attempt).await;
                last_error = Some(err);
                continue;
            }
            return Err(err);
        }

        return Ok(outcome);
    }

    Err(last_error.unwrap_or_else(|| IngestError::new(ErrorKind::CrawlTimeout, "crawl retries exhausted")))
}

async fn sleep_backoff(attempt: u32) {
    let secs = CRAWL_INITIAL_BACKOFF_S * 2u64.pow(attempt - 1);
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeCrawler {
        attempts: AtomicUsize,
        outcomes: StdMutex<Vec<crate::crawler::CrawlOutcome>>,
    }

    #[async_trait]
    impl Crawler for FakeCrawler {
        async fn fetch(&self, _url: &Url, _config: &CrawlConfig) -> crate::crawler::CrawlOutcome {
            let idx = self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if idx < outcomes.len() {
                outcomes[idx].clone()
            } else {
                outcomes.last().cloned().unwrap()
            }
        }

        async fn close(&self) {}
    }

    fn test_config() -> Config {
        Config {
            nsq_lookupd_http: String::new(),
            nsq_topic_ingest: String::new(),
            nsq_channel_worker: String::new(),
            nsq_topic_result: String::new(),
            nsqd_tcp_address: String::new(),
            gemini_api_key: String::new(),
            nsq_max_in_flight: 8,
            nsq_heartbeat_interval_secs: 60,
            crawler_page_timeout_ms: 1000,
            env: "production".to_string(),
            retry_max_attempts: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_backoff_multiplier: 2,
        }
    }

    #[test]
    fn bypasses_llm_for_txt_paths() {
        let url = Url::parse("https://example.com/llms.txt").unwrap();
        assert!(bypasses_llm_filter(&url));
        let url = Url::parse("https://example.com/docs").unwrap();
        assert!(!bypasses_llm_filter(&url));
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let crawler = FakeCrawler {
            attempts: AtomicUsize::new(0),
            outcomes: StdMutex::new(vec![crate::crawler::CrawlOutcome {
                success: false,
                error_message: Some("forbidden by robots.txt".to_string()),
                ..Default::default()
            }]),
        };
        let url = Url::parse("https://example.com/page").unwrap();
        let cfg = test_config();
        let crawl_cfg = CrawlConfig {
            cache_enabled: true,
            exclude_external_links: true,
            use_llm_filter: false,
            check_robots_txt: true,
            page_timeout_ms: cfg.crawler_page_timeout_ms,
        };
        let result = crawl_with_retries(&crawler, &url, &crawl_cfg, &cfg).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::CrawlBlocked);
        assert_eq!(crawler.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn link_resolution_keeps_only_same_site_links() {
        let base = Url::parse("https://example.com/docs").unwrap();
        assert_eq!(
            resolve_same_site_link(&base, "/guide"),
            Some("https://example.com/guide".to_string())
        );
        assert_eq!(resolve_same_site_link(&base, "https://other.com/x"), None);
    }

    #[test]
    fn path_segments_are_joined_with_arrow() {
        let url = Url::parse("https://example.com/a/b/c").unwrap();
        assert_eq!(join_path_segments(&url), "a > b > c");
    }
}
