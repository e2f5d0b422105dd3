//! Application wiring and the message loop (spec.md §4.E, §4.F).

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore};
use tracing::{info, info_span, warn, Instrument};

use crate::broker::{Consumer, Message, Producer};
use crate::config::Config;
use crate::crawler::{looks_like_crawler_crash, CrawlerHandle};
use crate::error::{is_transient_message, IngestError};
use crate::file::handle_file;
use crate::llm::LlmCircuit;
use crate::pool::WorkerPool;
use crate::task::{decode_body, redacted_for_log, ContentRecord, DecodedBody, ResultPayload, Task};
use crate::web::handle_web;

const TOUCH_INTERVAL: Duration = Duration::from_secs(10);

pub struct App {
    pub config: Config,
    pub crawler: CrawlerHandle,
    pub pool: Arc<WorkerPool>,
    pub semaphore: Arc<Semaphore>,
    pub circuit: LlmCircuit,
    pub producer: Arc<dyn Producer>,
    pub http_client: reqwest::Client,
}

impl App {
    pub fn new(config: Config, self_exe: std::path::PathBuf, producer: Arc<dyn Producer>) -> anyhow::Result<Self> {
        let semaphore = Arc::new(Semaphore::new(config.nsq_max_in_flight));
        let pool = WorkerPool::new(self_exe);
        let http_client = crate::http::build_client(&crate::http::HttpOptions::default())?;
        Ok(Self {
            config,
            crawler: CrawlerHandle::new(),
            pool,
            semaphore,
            circuit: LlmCircuit::new(),
            producer,
            http_client,
        })
    }

    /// Run the consume loop until `shutdown` resolves, then perform best-effort
    /// cleanup of external resources (spec.md §4.F).
    pub async fn run(self: Arc<Self>, mut consumer: Box<dyn Consumer>, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping broker consumption");
                    break;
                }
                maybe_msg = consumer.next() => {
                    match maybe_msg {
                        Some(msg) => {
                            let app = Arc::clone(&self);
                            tokio::spawn(async move {
                                app.process_message(msg).await;
                            });
                        }
                        None => {
                            warn!("broker consumer stream ended");
                            break;
                        }
                    }
                }
            }
        }

        self.crawler.close().await;
        info!("shutdown complete");
    }

    /// `process_message` never raises to the broker (spec.md §4.E).
    pub async fn process_message(&self, msg: Box<dyn Message>) {
        let attempts = msg.attempts();
        let body = msg.body().to_vec();
        let msg = Arc::new(AsyncMutex::new(msg));

        // Step 1: keep-alive. Cancelled (aborted) in every exit path below.
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let keepalive_handle = spawn_keepalive(Arc::clone(&msg), cancel_tx);

        let outcome = self.process_body(&body, attempts, cancel_rx).await;
        keepalive_handle.abort();

        let mut msg = msg.lock().await;

        match outcome {
            ProcessOutcome::Cancelled => {
                warn!("processing cancelled after keep-alive touch failure");
            }
            ProcessOutcome::DecodeFailed => {
                let _ = msg.finish().await;
            }
            ProcessOutcome::Requeue { delay_ms, reason } => {
                info!(delay_ms, reason = %reason, "requeueing message for transient failure");
                let _ = msg.requeue(Duration::from_millis(delay_ms), true).await;
            }
            ProcessOutcome::Completed { records, source_id, depth, started_at, url } => {
                self.publish_results(&source_id, records, depth, &url).await;
                let _ = msg.finish().await;
                info!(duration_ms = crate::util::elapsed_ms(started_at), "message_processed");
            }
            ProcessOutcome::Failed { source_id, err, url, original_payload } => {
                let payload = ResultPayload::failure(&source_id, &err, &url, original_payload);
                self.publish_one(&payload).await;
                let _ = msg.finish().await;
            }
        }
    }

    async fn process_body(&self, body: &[u8], attempts: u32, mut cancel_rx: oneshot::Receiver<()>) -> ProcessOutcome {
        let decoded = match decode_body(body) {
            Ok(d) => d,
            Err(_) => return ProcessOutcome::DecodeFailed,
        };

        let (task, source_id, task_type, url_for_log, original_payload) = match &decoded {
            DecodedBody::Known(task) => {
                let raw = serde_json::to_value(task).unwrap_or(Value::Null);
                (
                    Some(task.clone()),
                    task.id().to_string(),
                    task.task_type(),
                    task.url_for_failure(),
                    redacted_for_log(&raw),
                )
            }
            DecodedBody::UnknownType { id, raw } => (None, id.clone().unwrap_or_default(), "unknown", String::new(), redacted_for_log(raw)),
        };

        let span = info_span!("process_message", correlation_id = %source_id, operation = "process_message", task_type = %task_type);

        // Step 3: context binding. Log the redacted decoded body before any
        // dispatch work begins (spec.md §4.E step 3, §8 property 5).
        span.in_scope(|| {
            info!(body = %original_payload, "message_received");
        });

        // Step 4: concurrency gate. Released when the permit is dropped at
        // the end of this function, i.e. before the keep-alive task is
        // reclaimed but after dispatch/publish complete.
        let _permit = match self.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return ProcessOutcome::Cancelled,
        };

        let started_at = Instant::now();
        let work = self.dispatch_and_publish_ready(task, &source_id, attempts, original_payload.clone());

        tokio::select! {
            _ = &mut cancel_rx => ProcessOutcome::Cancelled,
            result = work.instrument(span) => {
                match result {
                    Ok((records, depth)) => ProcessOutcome::Completed { records, source_id, depth, started_at, url: url_for_log },
                    Err(Outcome::Requeue { delay_ms, reason }) => ProcessOutcome::Requeue { delay_ms, reason },
                    Err(Outcome::Failed { err, url }) => ProcessOutcome::Failed { source_id, err, url, original_payload },
                }
            }
        }
    }

    /// Dispatch step 5 plus the exception-classification step 8, minus
    /// publish/finish (those happen in `process_message` once the keep-alive
    /// task has been reclaimed).
    async fn dispatch_and_publish_ready(
        &self,
        task: Option<Task>,
        source_id: &str,
        attempts: u32,
        _original_payload: Value,
    ) -> Result<(Vec<ContentRecord>, i64), Outcome> {
        let Some(task) = task else {
            // Unknown type -> empty result list (spec.md §4.E step 5).
            return Ok((Vec::new(), 0));
        };

        let depth = task.depth();
        let url_for_failure = task.url_for_failure();

        let result = match &task {
            Task::Web { url, gemini_api_key, .. } => {
                let crawler = self.crawler.get_or_init().await.map_err(|e| IngestError::new(crate::error::ErrorKind::CrawlTimeout, e.to_string()));
                let crawler = match crawler {
                    Ok(c) => c,
                    Err(e) => return Err(self.classify_dispatch_error(e, attempts, &url_for_failure)),
                };

                let api_key = gemini_api_key.clone().or_else(|| {
                    if self.config.gemini_api_key.is_empty() {
                        None
                    } else {
                        Some(crate::task::ApiKey::from_config(&self.config.gemini_api_key))
                    }
                });

                let outcome = handle_web(url, api_key.as_ref(), crawler.as_ref(), &self.http_client, &self.config, &self.circuit).await;

                if let Err(err) = &outcome {
                    if looks_like_crawler_crash(&err.message) {
                        warn!(error = %err.message, "crawler crash detected, restarting singleton");
                        self.crawler.restart().await;
                    }
                }

                outcome.map_err(|e| self.classify_dispatch_error(e, attempts, &url_for_failure))
            }
            Task::File { path, .. } => handle_file(path, &self.pool)
                .await
                .map_err(|e| self.classify_dispatch_error(e, attempts, &url_for_failure)),
        };

        let _ = source_id;
        result.map(|records| (records, depth))
    }

    fn classify_dispatch_error(&self, err: IngestError, attempts: u32, url: &str) -> Outcome {
        let transient = err.is_transient() || is_transient_message(&err.message);
        if transient && attempts <= self.config.retry_max_attempts {
            Outcome::Requeue {
                delay_ms: self.config.requeue_delay_ms(attempts),
                reason: err.message,
            }
        } else {
            Outcome::Failed {
                url: url.to_string(),
                err,
            }
        }
    }

    async fn publish_results(&self, source_id: &str, records: Vec<ContentRecord>, depth: i64, url: &str) {
        if records.is_empty() {
            let err = IngestError::new(crate::error::ErrorKind::Empty, "No content extracted");
            let payload = ResultPayload::failure_with_message(source_id, err.kind.as_code(), &err.message, url, Value::Null);
            self.publish_one(&payload).await;
            return;
        }

        for record in records {
            let payload = ResultPayload::success(source_id, record, depth);
            self.publish_one(&payload).await;
        }
    }

    async fn publish_one(&self, payload: &ResultPayload) {
        match payload.to_json() {
            Ok(bytes) => {
                if let Err(e) = self.producer.publish(&self.config.nsq_topic_result, bytes).await {
                    warn!(error = %e, "failed to publish result, continuing");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize result payload"),
        }
    }
}

enum Outcome {
    Requeue { delay_ms: u64, reason: String },
    Failed { err: IngestError, url: String },
}

enum ProcessOutcome {
    Cancelled,
    DecodeFailed,
    Requeue { delay_ms: u64, reason: String },
    Completed {
        records: Vec<ContentRecord>,
        source_id: String,
        depth: i64,
        started_at: Instant,
        url: String,
    },
    Failed {
        source_id: String,
        err: IngestError,
        url: String,
        original_payload: Value,
    },
}

/// Spawn the background touch task: every [`TOUCH_INTERVAL`] until aborted,
/// call `msg.touch()`. If `touch` fails (stream closed, broker error), signal
/// `cancel_tx` so the main processing task cancels, then stop touching.
/// `process_message` aborts this task in every exit path, satisfying "the
/// keep-alive MUST be cancelled in all exit paths" even on the success path,
/// where touch never fails.
fn spawn_keepalive(msg: Arc<AsyncMutex<Box<dyn Message>>>, cancel_tx: oneshot::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TOUCH_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it

        loop {
            interval.tick().await;
            let touch_result = msg.lock().await.touch().await;
            if let Err(e) = touch_result {
                warn!(error = %e, "touch failed, cancelling message processing");
                let _ = cancel_tx.send(());
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fakes::{FakeMessage, FakeProducer};
    use std::sync::Mutex as StdMutex;

    fn test_config() -> Config {
        Config {
            nsq_lookupd_http: String::new(),
            nsq_topic_ingest: String::new(),
            nsq_channel_worker: String::new(),
            nsq_topic_result: "ingest.result".to_string(),
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

    fn test_app(producer: Arc<FakeProducer>) -> App {
        App::new(test_config(), std::path::PathBuf::from("ingestion-worker"), producer).unwrap()
    }

    #[tokio::test]
    async fn invalid_json_body_finishes_with_no_publish() {
        let producer = Arc::new(FakeProducer::default());
        let app = test_app(producer.clone());

        let msg = FakeMessage {
            body: b"not json".to_vec(),
            attempts: 1,
            touched: StdMutex::new(0),
            finished: StdMutex::new(false),
            requeued: StdMutex::new(None),
            fail_touch: false,
        };

        app.process_message(Box::new(msg)).await;

        assert!(producer.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_task_type_publishes_no_content_extracted_failure() {
        let producer = Arc::new(FakeProducer::default());
        let app = test_app(producer.clone());

        let msg = FakeMessage {
            body: br#"{"id":"t9","type":"carrier_pigeon"}"#.to_vec(),
            attempts: 1,
            touched: StdMutex::new(0),
            finished: StdMutex::new(false),
            requeued: StdMutex::new(None),
            fail_touch: false,
        };

        app.process_message(Box::new(msg)).await;

        let published = producer.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let body: Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body["status"], "failed");
        assert_eq!(body["code"], "EMPTY");
        assert_eq!(body["error"], "No content extracted");
    }

    #[test]
    fn transient_error_within_retry_budget_requeues() {
        let producer = Arc::new(FakeProducer::default());
        let app = test_app(producer);
        let err = IngestError::new(crate::error::ErrorKind::CrawlTimeout, "net::ERR_TIMED_OUT");

        match app.classify_dispatch_error(err, 1, "http://example.com") {
            Outcome::Requeue { delay_ms, .. } => assert_eq!(delay_ms, 1_000),
            Outcome::Failed { .. } => panic!("expected a requeue outcome"),
        }
    }

    #[test]
    fn transient_error_past_retry_budget_is_terminal() {
        let producer = Arc::new(FakeProducer::default());
        let app = test_app(producer);
        let err = IngestError::new(crate::error::ErrorKind::CrawlTimeout, "net::ERR_TIMED_OUT");

        match app.classify_dispatch_error(err, 4, "http://example.com") {
            Outcome::Failed { url, .. } => assert_eq!(url, "http://example.com"),
            Outcome::Requeue { .. } => panic!("expected a terminal failure after exhausting retries"),
        }
    }

    #[test]
    fn terminal_kind_fails_immediately_regardless_of_attempts() {
        let producer = Arc::new(FakeProducer::default());
        let app = test_app(producer);
        let err = IngestError::new(crate::error::ErrorKind::CrawlBlocked, "blocked by robots.txt");

        match app.classify_dispatch_error(err, 1, "http://example.com") {
            Outcome::Failed { .. } => {}
            Outcome::Requeue { .. } => panic!("CrawlBlocked is terminal, not transient"),
        }
    }
}
