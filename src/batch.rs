//! Batch execution: one engine run per requested concurrency level.
//!
//! A batch trials the same request set at several concurrency levels,
//! sequentially, and collects one [`RunResult`] per level. Received
//! distributed submissions are run through the same path.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::distribution::BatchHandler;
use crate::engine::{LoadEngine, NoopObserver, RunObserver};
use crate::payload::BatchSpec;
use crate::results::RunResult;
use crate::transport::{HttpTransport, RequestTransport};

/// Result of one concurrency-level trial.
#[derive(Debug, Clone)]
pub struct TrialReport {
    pub concurrency: u32,
    pub result: RunResult,
}

/// Aggregate over all trials of one batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub name: String,
    pub trials: Vec<TrialReport>,
}

impl BatchReport {
    pub fn completed(&self) -> u64 {
        self.trials.iter().map(|t| t.result.completed).sum()
    }

    pub fn successful(&self) -> u64 {
        self.trials.iter().map(|t| t.result.successful).sum()
    }

    pub fn failed(&self) -> u64 {
        self.trials.iter().map(|t| t.result.failed).sum()
    }

    pub fn requests(&self) -> u64 {
        self.trials.iter().map(|t| t.result.requests).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.trials.iter().map(|t| t.result.total_bytes).sum()
    }
}

type TransportFactory = dyn Fn() -> Arc<dyn RequestTransport> + Send + Sync;

/// Runs batches locally, one fresh transport per trial so session state never
/// leaks between concurrency levels.
pub struct BatchRunner {
    observer: Arc<dyn RunObserver>,
    transport_factory: Box<TransportFactory>,
}

impl BatchRunner {
    pub fn new() -> Self {
        Self {
            observer: Arc::new(NoopObserver),
            transport_factory: Box::new(|| Arc::new(HttpTransport::new()) as Arc<dyn RequestTransport>),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_transport_factory(mut self, factory: Box<TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    pub async fn run(&self, batch: &BatchSpec) -> BatchReport {
        let mut report = BatchReport {
            name: batch.name.clone(),
            trials: Vec::new(),
        };

        if batch.load_size == 0 || batch.requests.is_empty() {
            warn!(batch = %batch.name, "Batch specifies no work");
            return report;
        }

        // A missing throughput window defaults to a tenth of the load.
        let throughput_size = if batch.throughput_size == 0 {
            (batch.load_size / 10).max(1)
        } else {
            batch.throughput_size
        };

        info!(
            batch = %batch.name,
            load_size = batch.load_size,
            levels = ?batch.concurrency_levels,
            "Batch starting"
        );

        for &concurrency in &batch.concurrency_levels {
            let transport = (self.transport_factory)();
            let engine = LoadEngine::new(transport).with_observer(self.observer.clone());

            let mut spec = batch.load_spec(concurrency);
            spec.throughput_size = throughput_size;

            info!(batch = %batch.name, concurrency, "Trial starting");
            let result = engine.run(&spec).await;
            info!(
                batch = %batch.name,
                concurrency,
                completed = result.completed,
                successful = result.successful,
                failed = result.failed,
                hits_per_second = result.hits_per_second,
                "Trial finished"
            );

            report.trials.push(TrialReport {
                concurrency,
                result,
            });
        }

        report
    }
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener handler that runs received submissions on this instance.
pub struct LocalBatchHandler {
    runner: BatchRunner,
}

impl LocalBatchHandler {
    pub fn new(runner: BatchRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl BatchHandler for LocalBatchHandler {
    async fn on_batch(&self, mut batch: BatchSpec, requester: String) {
        batch.name = format!("{} (distributed from {})", batch.name, requester);
        let report = self.runner.run(&batch).await;
        info!(
            batch = %report.name,
            completed = report.completed(),
            successful = report.successful(),
            failed = report.failed(),
            "Distributed batch finished"
        );
    }
}
