use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Worker configuration, loaded once at startup from the environment.
///
/// Mirrors spec.md §6's table exactly. Unset variables fall back to the
/// documented defaults; a variable that *is* set but fails to parse as the
/// expected type is a startup error.
#[derive(Debug, Clone)]
pub struct Config {
    pub nsq_lookupd_http: String,
    pub nsq_topic_ingest: String,
    pub nsq_channel_worker: String,
    pub nsq_topic_result: String,
    pub nsqd_tcp_address: String,
    pub gemini_api_key: String,
    pub nsq_max_in_flight: usize,
    pub nsq_heartbeat_interval_secs: u64,
    pub crawler_page_timeout_ms: u64,
    pub env: String,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_backoff_multiplier: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            nsq_lookupd_http: env_string("NSQ_LOOKUPD_HTTP", "nsqlookupd:4161"),
            nsq_topic_ingest: env_string("NSQ_TOPIC_INGEST", "ingest.task"),
            nsq_channel_worker: env_string("NSQ_CHANNEL_WORKER", "worker"),
            nsq_topic_result: env_string("NSQ_TOPIC_RESULT", "ingest.result"),
            nsqd_tcp_address: env_string("NSQD_TCP_ADDRESS", "nsqd:4150"),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            nsq_max_in_flight: env_parsed("NSQ_MAX_IN_FLIGHT", 8)?,
            nsq_heartbeat_interval_secs: env_parsed("NSQ_HEARTBEAT_INTERVAL", 60)?,
            crawler_page_timeout_ms: env_parsed("CRAWLER_PAGE_TIMEOUT", 120_000)?,
            env: env_string("ENV", "production"),
            retry_max_attempts: env_parsed("RETRY_MAX_ATTEMPTS", 3)?,
            retry_initial_delay_ms: env_parsed("RETRY_INITIAL_DELAY_MS", 1_000)?,
            retry_max_delay_ms: env_parsed("RETRY_MAX_DELAY_MS", 60_000)?,
            retry_backoff_multiplier: env_parsed("RETRY_BACKOFF_MULTIPLIER", 2)?,
        })
    }

    pub fn is_development(&self) -> bool {
        self.env == "development"
    }

    pub fn crawl_outer_deadline(&self) -> Duration {
        Duration::from_millis(self.crawler_page_timeout_ms) + Duration::from_secs(5)
    }

    /// Exponential backoff delay for a given 1-based attempt count, capped at
    /// `retry_max_delay_ms` (spec.md §4.E step 8).
    pub fn requeue_delay_ms(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1);
        let scaled = self
            .retry_initial_delay_ms
            .saturating_mul(self.retry_backoff_multiplier.saturating_pow(exp));
        scaled.min(self.retry_max_delay_ms)
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))
            .with_context(|| format!("failed to parse environment variable {key}")),
        Err(_) => Ok(default),
    }
}
