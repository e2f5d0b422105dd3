//! LLM-backed content filter (Gemini) and its circuit breaker.
//!
//! Grounded on `handlers/web.py`'s `LLMConfig(provider="gemini/...")` /
//! `LLMContentFilter(instruction=..., chunk_token_threshold=8000)`. The HTTP
//! call itself is plain `reqwest` JSON, matching the teacher's `http.rs`
//! client-building style.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::task::ApiKey;

pub const CHUNK_TOKEN_THRESHOLD: u32 = 8000;
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 3;
pub const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(300);

const EXTRACTION_INSTRUCTION: &str = "Preserve code, signatures, configuration, and technical prose. Remove navigation, legal text, marketing copy, and cookie banners.";

const GEMINI_MODEL: &str = "gemini-3-flash-preview";
const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Clone)]
pub struct LlmFilterConfig {
    pub temperature: f32,
    pub chunk_token_threshold: u32,
    pub instruction: String,
}

impl Default for LlmFilterConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            chunk_token_threshold: CHUNK_TOKEN_THRESHOLD,
            instruction: EXTRACTION_INSTRUCTION.to_string(),
        }
    }
}

/// Ask Gemini to distill `raw_markdown` down to the content the instruction
/// says to keep. Returns `None` on any transport/parse failure; the caller
/// treats a filter failure as "no fit_markdown", never a hard error.
pub async fn filter_content(
    client: &reqwest::Client,
    api_key: &ApiKey,
    config: &LlmFilterConfig,
    raw_markdown: &str,
) -> Option<String> {
    let url = format!(
        "{GEMINI_ENDPOINT}/{GEMINI_MODEL}:generateContent?key={}",
        api_key.as_str()
    );

    let prompt = format!("{}\n\n---\n\n{}", config.instruction, raw_markdown);

    let body = json!({
        "contents": [{ "parts": [{ "text": prompt }] }],
        "generationConfig": { "temperature": config.temperature },
    });

    let resp = client.post(&url).json(&body).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let parsed: serde_json::Value = resp.json().await.ok()?;
    let text = parsed
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()?
        .to_string();

    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Process-wide circuit breaker gating whether `handle_web` attempts an LLM
/// filter at all (spec.md §4.D "LLM circuit breaker").
pub struct LlmCircuit {
    consecutive_failures: AtomicU32,
    open_until: Mutex<Option<Instant>>,
}

impl LlmCircuit {
    pub fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            open_until: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        match *self.open_until.lock().unwrap() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Record the outcome of an attempt that used the LLM filter. `fit_markdown`
    /// is the value the crawl produced for this call, if any.
    pub fn record(&self, fit_markdown: Option<&str>) {
        let produced_content = fit_markdown.map(|s| !s.trim().is_empty()).unwrap_or(false);
        if produced_content {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            *self.open_until.lock().unwrap() = None;
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= CIRCUIT_FAILURE_THRESHOLD {
                *self.open_until.lock().unwrap() = Some(Instant::now() + CIRCUIT_OPEN_DURATION);
            }
        }
    }
}

impl Default for LlmCircuit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_opens_after_threshold_failures_and_resets_on_success() {
        let circuit = LlmCircuit::new();
        assert!(!circuit.is_open());

        circuit.record(None);
        circuit.record(Some("   "));
        assert!(!circuit.is_open());

        circuit.record(None);
        assert!(circuit.is_open());

        // A later success (e.g. after the open window elapses and a fresh
        // call runs) resets the breaker.
        circuit.record(Some("real content"));
        assert_eq!(circuit.consecutive_failures.load(Ordering::SeqCst), 0);
    }
}
