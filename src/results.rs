//! Result and notification types for a load run.
//!
//! A run produces one [`RequestResult`] per issued request, one
//! [`IterationResult`] per completed iteration, and a final [`RunResult`]
//! aggregate. [`RunSnapshot`] and [`ThroughputSample`] are the payloads of the
//! progress and throughput notifications published while the run is live.

use std::time::SystemTime;

/// Result of one request within one iteration. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct RequestResult {
    /// Position of the request within the iteration's request list.
    pub index: usize,

    pub started_at: SystemTime,
    pub finished_at: SystemTime,

    /// Response body size in bytes.
    pub bytes: u64,

    pub success: bool,

    /// Failure message when the request did not succeed.
    pub message: Option<String>,
}

/// Result of one full pass through the request list.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub started_at: SystemTime,
    pub finished_at: SystemTime,

    /// Wall time of the iteration in milliseconds.
    pub elapsed_ms: u64,

    /// Sum of the response bytes over this iteration's requests.
    pub bytes: u64,

    /// True iff every request in the iteration succeeded.
    pub success: bool,

    /// Per-request results in execution order.
    pub requests: Vec<RequestResult>,
}

/// Aggregate over all iterations of one load trial.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub started_at: SystemTime,
    pub finished_at: SystemTime,

    /// Total wall time of the run in milliseconds.
    pub total_time_ms: u64,

    pub completed: u64,
    pub successful: u64,
    pub failed: u64,

    /// Total number of completed requests across all iterations.
    pub requests: u64,

    pub avg_iteration_ms: f64,
    pub avg_request_ms: f64,
    pub hits_per_second: f64,
    pub requests_per_second: f64,

    pub total_bytes: u64,
    pub bytes_per_hit: u64,
    pub bytes_per_request: u64,

    /// Extremes of the windowed throughput samples observed during the run.
    /// All zero when no window fired.
    pub min_avg_iteration_ms: f64,
    pub max_avg_iteration_ms: f64,
    pub min_hits_per_second: f64,
    pub max_hits_per_second: f64,

    /// Run-level failure message, if the orchestration itself failed.
    pub message: Option<String>,

    /// Per-iteration results in completion order.
    pub iterations: Vec<IterationResult>,
}

impl RunResult {
    /// A zero-valued result, returned for empty load specs and used as the
    /// base for finalization.
    pub fn zeroed() -> Self {
        let now = SystemTime::now();
        Self {
            started_at: now,
            finished_at: now,
            total_time_ms: 0,
            completed: 0,
            successful: 0,
            failed: 0,
            requests: 0,
            avg_iteration_ms: 0.0,
            avg_request_ms: 0.0,
            hits_per_second: 0.0,
            requests_per_second: 0.0,
            total_bytes: 0,
            bytes_per_hit: 0,
            bytes_per_request: 0,
            min_avg_iteration_ms: 0.0,
            max_avg_iteration_ms: 0.0,
            min_hits_per_second: 0.0,
            max_hits_per_second: 0.0,
            message: None,
            iterations: Vec::new(),
        }
    }

    /// Number of successful requests across all iterations.
    pub fn successful_requests(&self) -> u64 {
        self.iterations
            .iter()
            .flat_map(|i| i.requests.iter())
            .filter(|r| r.success)
            .count() as u64
    }
}

/// Aggregate-so-far published with each progress notification.
#[derive(Debug, Clone, Copy)]
pub struct RunSnapshot {
    pub completed: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_bytes: u64,

    /// Wall time elapsed since the run started, in milliseconds.
    pub elapsed_ms: u64,
}

/// Windowed throughput statistics over the most recent completed iterations.
#[derive(Debug, Clone, Copy)]
pub struct ThroughputSample {
    /// Number of iterations in the sampled window.
    pub window_len: usize,

    /// Wall time elapsed since the run started, in milliseconds.
    pub total_time_ms: u64,

    /// Average iteration time so far, in milliseconds.
    pub avg_iteration_ms: f64,

    pub hits_per_second: f64,

    /// Total bytes over the sampled window.
    pub window_bytes: u64,

    /// Bytes per iteration over the sampled window.
    pub bytes_per_hit: u64,
}
