use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use loadcast::batch::{BatchRunner, LocalBatchHandler};
use loadcast::config::Config;
use loadcast::distribution::{DistributionListener, Distributor};
use loadcast::engine::RunObserver;
use loadcast::results::{RunSnapshot, ThroughputSample};

/// Logs run progress once per throughput window plus every windowed sample.
struct ProgressLogger {
    window: u64,
}

impl RunObserver for ProgressLogger {
    fn on_progress(&self, snapshot: &RunSnapshot) -> bool {
        if self.window > 0 && snapshot.completed % self.window == 0 {
            info!(
                completed = snapshot.completed,
                successful = snapshot.successful,
                failed = snapshot.failed,
                "Progress"
            );
        }
        false
    }

    fn on_throughput(&self, sample: &ThroughputSample) {
        info!(
            avg_ms = sample.avg_iteration_ms,
            hits_per_second = sample.hits_per_second,
            window_kb = sample.window_bytes / 1024,
            kb_per_hit = sample.bytes_per_hit / 1024,
            "Throughput"
        );
    }
}

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Required environment variables:");
    eprintln!(
        "  TARGET_URL              - The URL to load test (must start with http:// or https://)"
    );
    eprintln!();
    eprintln!("Optional environment variables:");
    eprintln!("  BATCH_NAME              - Name attached to this batch (default: local)");
    eprintln!("  REQUEST_TYPE            - HTTP method: GET or POST (default: GET)");
    eprintln!("  LOAD_SIZE               - Iterations per trial (default: 100)");
    eprintln!("  CONCURRENCY_LEVELS      - Comma-separated levels to trial (default: 10)");
    eprintln!("  THROUGHPUT_WINDOW       - Iterations per throughput sample (default: LOAD_SIZE/10)");
    eprintln!();
    eprintln!("Distributed coordination:");
    eprintln!("  LISTEN_ADDRS            - Addresses to accept batch submissions on, e.g. 0.0.0.0:7700");
    eprintln!("  PEER_ENDPOINTS          - Peer URLs to forward this batch to, e.g. http://peer:7700/");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            std::process::exit(1);
        }
    };

    let batch = config.to_batch();
    let window = if batch.throughput_size > 0 {
        batch.throughput_size
    } else {
        (batch.load_size / 10).max(1)
    };
    let observer = Arc::new(ProgressLogger { window });

    // Accept distributed submissions while this instance runs its own batch.
    let listener = if !config.listen_addrs.is_empty() {
        let handler = Arc::new(LocalBatchHandler::new(
            BatchRunner::new().with_observer(observer.clone()),
        ));
        let listener = DistributionListener::new(handler);
        if listener.start(&config.listen_addrs) {
            Some(listener)
        } else {
            warn!("Control listener could not start");
            None
        }
    } else {
        None
    };

    if !config.peer_endpoints.is_empty() {
        info!(peers = config.peer_endpoints.len(), "Distributing batch to peers");
        match Distributor::new()
            .distribute(&batch, &config.peer_endpoints)
            .await
        {
            Ok(failures) => {
                for failure in &failures {
                    warn!(endpoint = %failure.endpoint, error = %failure.message, "Distribution failed");
                }
            }
            Err(e) => warn!(error = %e, "Batch could not be serialized for distribution"),
        }
    }

    let report = BatchRunner::new()
        .with_observer(observer)
        .run(&batch)
        .await;

    for trial in &report.trials {
        info!(
            concurrency = trial.concurrency,
            completed = trial.result.completed,
            successful = trial.result.successful,
            failed = trial.result.failed,
            avg_ms = trial.result.avg_iteration_ms,
            hits_per_second = trial.result.hits_per_second,
            requests_per_second = trial.result.requests_per_second,
            total_kb = trial.result.total_bytes / 1024,
            "Trial summary"
        );
    }
    info!(
        batch = %report.name,
        completed = report.completed(),
        successful = report.successful(),
        failed = report.failed(),
        requests = report.requests(),
        total_kb = report.total_bytes() / 1024,
        "Batch finished"
    );

    if let Some(listener) = listener {
        info!("Awaiting distributed submissions, press ctrl-c to exit");
        let _ = tokio::signal::ctrl_c().await;
        listener.stop();
    }
}
