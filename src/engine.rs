//! Concurrent load-generation engine.
//!
//! [`LoadEngine::run`] executes `load_size` independent iterations of a fixed
//! request list with at most `concurrent_size` iterations in flight.
//! Iterations are the unit of parallelism; requests within an iteration run
//! strictly in order. Results accumulate in a shared [`ConcurrentBuffer`],
//! aggregate counters are atomic, and a [`RunObserver`] receives a progress
//! notification per completed iteration plus a windowed throughput sample
//! every `throughput_size` completions.
//!
//! Cancellation is cooperative: an explicit [`CancelFlag`] is polled by the
//! dispatch loop before each iteration starts. In-flight iterations and
//! requests always run to completion.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::buffer::ConcurrentBuffer;
use crate::payload::{LoadSpec, RequestSpec};
use crate::results::{IterationResult, RequestResult, RunResult, RunSnapshot, ThroughputSample};
use crate::transport::{RequestTransport, SessionContext};

/// Shared cancellation flag. Cheap to clone; setting it prevents iterations
/// that have not yet started from being scheduled.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Consumer of live run notifications.
///
/// Notifications are published by whichever worker observed the triggering
/// completion, so they interleave across workers; only the completed count is
/// guaranteed monotonically non-decreasing.
pub trait RunObserver: Send + Sync {
    /// Called after every completed iteration. Returning true requests
    /// cancellation of not-yet-started iterations.
    fn on_progress(&self, snapshot: &RunSnapshot) -> bool {
        let _ = snapshot;
        false
    }

    /// Called once per full throughput window.
    fn on_throughput(&self, sample: &ThroughputSample) {
        let _ = sample;
    }
}

/// Observer that ignores all notifications.
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Running min/max over the windowed throughput samples of one run.
#[derive(Debug, Default)]
struct ThroughputExtremes {
    samples: u64,
    min_avg_ms: f64,
    max_avg_ms: f64,
    min_hits_per_second: f64,
    max_hits_per_second: f64,
}

impl ThroughputExtremes {
    fn fold(&mut self, avg_ms: f64, hits_per_second: f64) {
        if self.samples == 0 {
            self.min_avg_ms = avg_ms;
            self.max_avg_ms = avg_ms;
            self.min_hits_per_second = hits_per_second;
            self.max_hits_per_second = hits_per_second;
        } else {
            self.min_avg_ms = self.min_avg_ms.min(avg_ms);
            self.max_avg_ms = self.max_avg_ms.max(avg_ms);
            self.min_hits_per_second = self.min_hits_per_second.min(hits_per_second);
            self.max_hits_per_second = self.max_hits_per_second.max(hits_per_second);
        }
        self.samples += 1;
    }
}

/// State shared by all iteration workers of one run.
struct RunState {
    buffer: ConcurrentBuffer<IterationResult>,
    completed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    total_bytes: AtomicU64,
    extremes: Mutex<ThroughputExtremes>,
    started: Instant,
    cancel: CancelFlag,
}

impl RunState {
    fn new(load_size: u64) -> Self {
        Self {
            buffer: ConcurrentBuffer::with_capacity(load_size as usize),
            completed: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            extremes: Mutex::new(ThroughputExtremes::default()),
            started: Instant::now(),
            cancel: CancelFlag::new(),
        }
    }

    /// Snapshot pinned to the completion count the publishing worker observed.
    fn snapshot(&self, completed: u64) -> RunSnapshot {
        RunSnapshot {
            completed,
            successful: self.successful.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            total_bytes: self.total_bytes.load(Ordering::SeqCst),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Executes load trials against a request transport.
pub struct LoadEngine {
    transport: Arc<dyn RequestTransport>,
    observer: Arc<dyn RunObserver>,
}

impl LoadEngine {
    pub fn new(transport: Arc<dyn RequestTransport>) -> Self {
        Self {
            transport,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Runs one load trial to completion (or cancellation) and returns the
    /// aggregate result together with every per-iteration result.
    pub async fn run(&self, spec: &LoadSpec) -> RunResult {
        let started_at = SystemTime::now();

        if spec.is_empty() {
            info!("Empty load spec, nothing to run");
            return RunResult::zeroed();
        }

        let state = Arc::new(RunState::new(spec.load_size));
        let session = Arc::new(self.authenticate(spec).await);
        let requests = Arc::new(spec.requests.clone());
        let concurrency = spec.concurrent_size.max(1) as usize;
        let semaphore = Arc::new(Semaphore::new(concurrency));

        info!(
            load_size = spec.load_size,
            concurrent = concurrency,
            requests = requests.len(),
            throughput_window = spec.throughput_size,
            "Load run starting"
        );

        let mut message: Option<String> = None;
        let mut handles = Vec::with_capacity(spec.load_size as usize);

        for seq in 0..spec.load_size {
            if state.cancel.is_cancelled() {
                info!(scheduled = seq, "Cancellation observed, no further iterations");
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    message = Some(format!("iteration scheduling failed: {}", e));
                    break;
                }
            };

            // The flag may have been set while waiting for a permit; an
            // iteration must never start after cancellation was observed.
            if state.cancel.is_cancelled() {
                info!(scheduled = seq, "Cancellation observed, no further iterations");
                break;
            }

            let transport = self.transport.clone();
            let observer = self.observer.clone();
            let state = state.clone();
            let requests = requests.clone();
            let session = session.clone();
            let throughput_size = spec.throughput_size;

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                run_iteration(
                    seq,
                    &requests,
                    transport.as_ref(),
                    &session,
                    &state,
                    observer.as_ref(),
                    throughput_size,
                )
                .await;
            }));
        }

        for handle in handles {
            if let Err(join_err) = handle.await {
                // A panicked worker is a run-level failure: stop scheduling,
                // record the message, keep the results already collected.
                state.cancel.cancel();
                error!(error = %join_err, "Iteration worker failed");
                message.get_or_insert_with(|| format!("iteration worker failed: {}", join_err));
            }
        }

        finalize(started_at, &state, message)
    }

    /// Issues the optional one-shot authentication call. A failure here is
    /// logged and the run proceeds with an anonymous session.
    async fn authenticate(&self, spec: &LoadSpec) -> SessionContext {
        let auth = match spec.auth.as_ref().filter(|a| !a.url.is_empty()) {
            Some(auth) => auth,
            None => return SessionContext::anonymous(),
        };

        let session_key = SessionContext::generate_key();
        let probe = SessionContext::with_key(session_key.clone());
        match self.transport.issue(auth, &probe).await {
            Ok(body) => {
                info!(url = %auth.url, "Authentication succeeded");
                SessionContext::from_auth_response(session_key, &body)
            }
            Err(e) => {
                warn!(url = %auth.url, error = %e, "Authentication failed, continuing anonymously");
                SessionContext::anonymous()
            }
        }
    }
}

/// One full pass through the request list.
async fn run_iteration(
    seq: u64,
    requests: &[RequestSpec],
    transport: &dyn RequestTransport,
    session: &SessionContext,
    state: &RunState,
    observer: &dyn RunObserver,
    throughput_size: u64,
) {
    let iteration_clock = Instant::now();
    let started_at = SystemTime::now();
    let mut request_results = Vec::with_capacity(requests.len());

    for (index, request) in requests.iter().enumerate() {
        let request_started = SystemTime::now();
        let outcome = transport.issue(request, session).await;
        let finished_at = SystemTime::now();

        let result = match outcome {
            Ok(body) => RequestResult {
                index,
                started_at: request_started,
                finished_at,
                bytes: body.len() as u64,
                success: true,
                message: None,
            },
            Err(e) => {
                debug!(iteration = seq, index, error = %e, "Request failed");
                RequestResult {
                    index,
                    started_at: request_started,
                    finished_at,
                    bytes: 0,
                    success: false,
                    message: Some(e.to_string()),
                }
            }
        };
        request_results.push(result);
    }

    let bytes: u64 = request_results.iter().map(|r| r.bytes).sum();
    let success = request_results.iter().all(|r| r.success);
    let item = IterationResult {
        started_at,
        finished_at: SystemTime::now(),
        elapsed_ms: iteration_clock.elapsed().as_millis() as u64,
        bytes,
        success,
        requests: request_results,
    };

    if success {
        state.successful.fetch_add(1, Ordering::SeqCst);
    } else {
        state.failed.fetch_add(1, Ordering::SeqCst);
    }
    state.total_bytes.fetch_add(bytes, Ordering::SeqCst);
    state.buffer.push(item);

    // fetch_add hands each worker a distinct completion count, so every
    // throughput window boundary is observed by exactly one worker.
    let completed = state.completed.fetch_add(1, Ordering::SeqCst) + 1;

    let snapshot = state.snapshot(completed);
    if observer.on_progress(&snapshot) {
        info!(completed, "Cancellation requested by progress observer");
        state.cancel.cancel();
    }

    if throughput_size > 0 && completed % throughput_size == 0 {
        publish_throughput(state, observer, completed, throughput_size);
    }
}

/// Computes and publishes one windowed throughput sample.
fn publish_throughput(
    state: &RunState,
    observer: &dyn RunObserver,
    completed: u64,
    throughput_size: u64,
) {
    let total_time_ms = state.started.elapsed().as_millis() as u64;
    let avg_iteration_ms = total_time_ms as f64 / completed as f64;
    let hits_per_second = if avg_iteration_ms > 0.0 {
        1000.0 / avg_iteration_ms
    } else {
        0.0
    };

    let window = state.buffer.tail(throughput_size.min(completed) as usize);
    let window_len = window.len();
    let window_bytes: u64 = window.iter().map(|i| i.bytes).sum();
    let bytes_per_hit = if window_len > 0 {
        window_bytes / window_len as u64
    } else {
        0
    };

    state
        .extremes
        .lock()
        .unwrap()
        .fold(avg_iteration_ms, hits_per_second);

    debug!(
        completed,
        window_len, avg_iteration_ms, hits_per_second, "Throughput window"
    );

    observer.on_throughput(&ThroughputSample {
        window_len,
        total_time_ms,
        avg_iteration_ms,
        hits_per_second,
        window_bytes,
        bytes_per_hit,
    });
}

/// Builds the final aggregate. Divisors can legitimately be zero when every
/// iteration was cancelled before starting; rates report zero in that case.
fn finalize(started_at: SystemTime, state: &RunState, message: Option<String>) -> RunResult {
    let total_time_ms = state.started.elapsed().as_millis() as u64;
    let completed = state.completed.load(Ordering::SeqCst);
    let successful = state.successful.load(Ordering::SeqCst);
    let failed = state.failed.load(Ordering::SeqCst);
    let total_bytes = state.total_bytes.load(Ordering::SeqCst);

    let iterations = state.buffer.snapshot();
    let requests: u64 = iterations.iter().map(|i| i.requests.len() as u64).sum();

    let avg_iteration_ms = if completed > 0 {
        total_time_ms as f64 / completed as f64
    } else {
        0.0
    };
    let hits_per_second = if avg_iteration_ms > 0.0 {
        1000.0 / avg_iteration_ms
    } else {
        0.0
    };
    let avg_request_ms = if requests > 0 {
        total_time_ms as f64 / requests as f64
    } else {
        0.0
    };
    let requests_per_second = if avg_request_ms > 0.0 {
        1000.0 / avg_request_ms
    } else {
        0.0
    };
    let bytes_per_hit = if completed > 0 { total_bytes / completed } else { 0 };
    let bytes_per_request = if requests > 0 { total_bytes / requests } else { 0 };

    let extremes = state.extremes.lock().unwrap();
    let (min_avg, max_avg, min_hps, max_hps) = if extremes.samples > 0 {
        (
            extremes.min_avg_ms,
            extremes.max_avg_ms,
            extremes.min_hits_per_second,
            extremes.max_hits_per_second,
        )
    } else {
        (0.0, 0.0, 0.0, 0.0)
    };

    info!(
        completed,
        successful, failed, requests, total_time_ms, total_bytes, "Load run finished"
    );

    RunResult {
        started_at,
        finished_at: SystemTime::now(),
        total_time_ms,
        completed,
        successful,
        failed,
        requests,
        avg_iteration_ms,
        avg_request_ms,
        hits_per_second,
        requests_per_second,
        total_bytes,
        bytes_per_hit,
        bytes_per_request,
        min_avg_iteration_ms: min_avg,
        max_avg_iteration_ms: max_avg,
        min_hits_per_second: min_hps,
        max_hits_per_second: max_hps,
        message,
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::RequestSpec;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Scripted transport: fixed body, optional delay, failure and panic
    /// triggered by URL substring, in-flight high-water mark for the
    /// concurrency bound.
    struct MockTransport {
        body: Vec<u8>,
        delay: Duration,
        calls: AtomicU64,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        seen_tokens: Mutex<Vec<Option<String>>>,
    }

    impl MockTransport {
        fn new(body_len: usize) -> Self {
            Self {
                body: vec![b'x'; body_len],
                delay: Duration::ZERO,
                calls: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                seen_tokens: Mutex::new(Vec::new()),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl RequestTransport for MockTransport {
        async fn issue(
            &self,
            spec: &RequestSpec,
            session: &SessionContext,
        ) -> Result<Vec<u8>, TransportError> {
            if spec.url.contains("panic") {
                panic!("scripted transport panic");
            }

            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if spec.url.contains("auth") {
                return Ok(br#"{"token":"t1"}"#.to_vec());
            }
            self.seen_tokens
                .lock()
                .unwrap()
                .push(session.auth_params.get("token").cloned());

            if spec.url.contains("fail") {
                return Err(TransportError::Status(500));
            }
            Ok(self.body.clone())
        }
    }

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<RunSnapshot>>,
        samples: Mutex<Vec<ThroughputSample>>,
        cancel_at: Option<u64>,
    }

    impl Recorder {
        fn cancelling_at(completed: u64) -> Self {
            Self {
                cancel_at: Some(completed),
                ..Default::default()
            }
        }
    }

    impl RunObserver for Recorder {
        fn on_progress(&self, snapshot: &RunSnapshot) -> bool {
            self.progress.lock().unwrap().push(*snapshot);
            self.cancel_at.is_some_and(|k| snapshot.completed >= k)
        }

        fn on_throughput(&self, sample: &ThroughputSample) {
            self.samples.lock().unwrap().push(*sample);
        }
    }

    fn spec(load_size: u64, concurrent_size: u32, throughput_size: u64) -> LoadSpec {
        LoadSpec {
            requests: vec![
                RequestSpec::get("http://localhost/a"),
                RequestSpec::get("http://localhost/b"),
            ],
            auth: None,
            load_size,
            concurrent_size,
            throughput_size,
        }
    }

    #[tokio::test]
    async fn empty_spec_returns_zeroed_without_transport_calls() {
        let transport = Arc::new(MockTransport::new(100));
        let engine = LoadEngine::new(transport.clone());

        let result = engine.run(&spec(0, 2, 0)).await;
        assert_eq!(result.completed, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        let no_requests = LoadSpec {
            load_size: 5,
            concurrent_size: 2,
            ..Default::default()
        };
        let result = engine.run(&no_requests).await;
        assert_eq!(result.completed, 0);
        assert_eq!(result.requests, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn counts_add_up() {
        let transport = Arc::new(MockTransport::new(10));
        let engine = LoadEngine::new(transport.clone());

        let result = engine.run(&spec(12, 3, 0)).await;

        assert_eq!(result.completed, 12);
        assert_eq!(result.successful + result.failed, 12);
        assert_eq!(result.successful, 12);
        assert_eq!(result.requests, 24);
        assert_eq!(result.iterations.len(), 12);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 24);
        assert!(result.message.is_none());
    }

    #[tokio::test]
    async fn end_to_end_batch_of_four() {
        let transport =
            Arc::new(MockTransport::new(100).with_delay(Duration::from_millis(5)));
        let observer = Arc::new(Recorder::default());
        let engine = LoadEngine::new(transport).with_observer(observer.clone());

        let result = engine.run(&spec(4, 2, 2)).await;

        assert_eq!(result.completed, 4);
        assert_eq!(result.successful, 4);
        assert_eq!(result.failed, 0);
        assert_eq!(result.requests, 8);
        assert_eq!(result.total_bytes, 800);

        let samples = observer.samples.lock().unwrap();
        assert_eq!(samples.len(), 2);
        for sample in samples.iter() {
            assert_eq!(sample.window_len, 2);
            assert_eq!(sample.window_bytes, 400);
            assert_eq!(sample.bytes_per_hit, 200);
            assert!(sample.hits_per_second > 0.0);
        }

        assert!(result.min_hits_per_second > 0.0);
        assert!(result.min_hits_per_second <= result.max_hits_per_second);
        assert!(result.min_avg_iteration_ms <= result.max_avg_iteration_ms);
    }

    #[tokio::test]
    async fn iteration_bytes_sum_over_requests() {
        let transport = Arc::new(MockTransport::new(100));
        let engine = LoadEngine::new(transport);

        let result = engine.run(&spec(3, 1, 0)).await;
        for iteration in &result.iterations {
            let sum: u64 = iteration.requests.iter().map(|r| r.bytes).sum();
            assert_eq!(iteration.bytes, sum);
            assert_eq!(iteration.bytes, 200);
            assert!(iteration.success);
        }
    }

    #[tokio::test]
    async fn failed_request_does_not_abort_iteration() {
        let transport = Arc::new(MockTransport::new(100));
        let engine = LoadEngine::new(transport.clone());

        let load = LoadSpec {
            requests: vec![
                RequestSpec::get("http://localhost/a"),
                RequestSpec::get("http://localhost/fail"),
                RequestSpec::get("http://localhost/b"),
            ],
            auth: None,
            load_size: 5,
            concurrent_size: 2,
            throughput_size: 0,
        };
        let result = engine.run(&load).await;

        assert_eq!(result.completed, 5);
        assert_eq!(result.failed, 5);
        assert_eq!(result.successful, 0);
        // Every request in the iteration still executed.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 15);
        for iteration in &result.iterations {
            assert_eq!(iteration.requests.len(), 3);
            assert!(!iteration.success);
            assert!(iteration.requests[1].message.is_some());
            assert!(iteration.requests[2].success);
            assert_eq!(iteration.bytes, 200);
        }
        assert_eq!(result.successful_requests(), 10);
    }

    #[tokio::test]
    async fn concurrency_bound_respected() {
        let transport =
            Arc::new(MockTransport::new(10).with_delay(Duration::from_millis(10)));
        let engine = LoadEngine::new(transport.clone());

        let result = engine.run(&spec(20, 4, 0)).await;

        assert_eq!(result.completed, 20);
        assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn cancellation_stops_scheduling_not_in_flight_work() {
        let transport = Arc::new(MockTransport::new(10));
        let observer = Arc::new(Recorder::cancelling_at(3));
        let engine = LoadEngine::new(transport).with_observer(observer.clone());

        let result = engine.run(&spec(50, 1, 0)).await;

        // With one worker the dispatch loop observes the flag before the
        // fourth iteration can start.
        assert_eq!(result.completed, 3);
        assert_eq!(result.iterations.len(), 3);
        assert!(result.message.is_none());

        let progress = observer.progress.lock().unwrap();
        let counts: Vec<u64> = progress.iter().map(|s| s.completed).collect();
        assert_eq!(counts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn throughput_fires_once_per_window() {
        let transport = Arc::new(MockTransport::new(10));
        let observer = Arc::new(Recorder::default());
        let engine = LoadEngine::new(transport).with_observer(observer.clone());

        let result = engine.run(&spec(10, 2, 3)).await;
        assert_eq!(result.completed, 10);

        let samples = observer.samples.lock().unwrap();
        assert_eq!(samples.len(), 3);
    }

    #[tokio::test]
    async fn auth_failure_proceeds_anonymously() {
        let transport = Arc::new(MockTransport::new(10));
        let engine = LoadEngine::new(transport.clone());

        let mut load = spec(4, 2, 0);
        load.auth = Some(RequestSpec::get("http://localhost/fail-login"));
        let result = engine.run(&load).await;

        assert_eq!(result.completed, 4);
        assert_eq!(result.successful, 4);
        // One auth attempt plus every load request.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 9);
        let tokens = transport.seen_tokens.lock().unwrap();
        assert!(tokens.iter().all(|t| t.is_none()));
    }

    #[tokio::test]
    async fn auth_params_reach_every_request() {
        let transport = Arc::new(MockTransport::new(10));
        let engine = LoadEngine::new(transport.clone());

        let mut load = spec(3, 2, 0);
        load.auth = Some(RequestSpec::get("http://localhost/auth"));
        let result = engine.run(&load).await;

        assert_eq!(result.completed, 3);
        let tokens = transport.seen_tokens.lock().unwrap();
        assert_eq!(tokens.len(), 6);
        assert!(tokens.iter().all(|t| t.as_deref() == Some("t1")));
    }

    #[tokio::test]
    async fn worker_panic_recorded_as_run_level_failure() {
        let transport = Arc::new(MockTransport::new(10));
        let engine = LoadEngine::new(transport);

        let load = LoadSpec {
            requests: vec![RequestSpec::get("http://localhost/panic")],
            auth: None,
            load_size: 3,
            concurrent_size: 1,
            throughput_size: 0,
        };
        let result = engine.run(&load).await;

        assert!(result.message.is_some());
        assert_eq!(result.completed, 0);
        assert_eq!(result.hits_per_second, 0.0);
        assert_eq!(result.bytes_per_hit, 0);
    }
}
