use std::path::PathBuf;
use std::sync::Arc;

use ingestion_worker::app::App;
use ingestion_worker::broker::{NsqConsumer, NsqProducer};
use ingestion_worker::config::Config;
use ingestion_worker::pool;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Hidden re-exec entry point: the worker pool spawns this same binary
    // with `--convert-worker <payload-path>` to run one conversion in an
    // isolated process (spec.md §4.C, §9 "process-pool isolation").
    if args.len() == 3 && args[1] == "--convert-worker" {
        if let Err(e) = pool::run_convert_worker(std::path::Path::new(&args[2])).await {
            eprintln!("convert-worker failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e:#}");
            std::process::exit(2);
        }
    };

    ingestion_worker::logging::init(&config);

    if let Err(e) = run(config).await {
        error!(error = %e, "ingestion worker exited with error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let self_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ingestion-worker"));

    let producer = Arc::new(NsqProducer::new(&config.nsqd_tcp_address));
    let consumer = NsqConsumer::new(
        &config.nsq_lookupd_http,
        &config.nsq_topic_ingest,
        &config.nsq_channel_worker,
        config.nsq_max_in_flight,
    )?;

    let producer_dyn: Arc<dyn ingestion_worker::broker::Producer> = producer.clone();
    let app = Arc::new(App::new(config, self_exe, producer_dyn)?);

    info!("ingestion worker starting");

    app.run(Box::new(consumer), shutdown_signal()).await;

    producer.close().await;
    Ok(())
}

/// Resolves once SIGINT or SIGTERM is received (spec.md §4.F). Best-effort:
/// a platform without `ctrl_c`/`signal` support simply never resolves and
/// the worker runs until killed.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
