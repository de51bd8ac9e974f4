use crate::snapshot::{FailureCounts, OperationMetrics, StatsSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const NUM_HISTOGRAM_BINS: usize = 100;

/// The three request kinds a worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Compile,
    Invoke,
    Release,
}

/// Why a request failed, mirroring the wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Compilation,
    Runtime,
    Timeout,
    NotFound,
}

impl FailureKind {
    fn index(self) -> usize {
        match self {
            FailureKind::Compilation => 0,
            FailureKind::Runtime => 1,
            FailureKind::Timeout => 2,
            FailureKind::NotFound => 3,
        }
    }
}

/// Outcome of one handled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureKind),
}

/// Logarithmic histogram for percentile estimation.
///
/// Each power of ten between 1μs and 10s is split into ten bins, so the
/// resolution is finest where latencies are short. Recording is a single
/// relaxed `fetch_add`; percentile estimation scans the bins once.
#[derive(Debug)]
pub(crate) struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    pub(crate) fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, latency_us: u64) {
        let bin = Self::latency_to_bin(latency_us);
        self.bins[bin].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }

        let decade = latency_us.ilog10();
        let leading_digit = latency_us / 10u64.pow(decade);
        let bin = decade as usize * 10 + leading_digit.min(9) as usize;

        bin.min(NUM_HISTOGRAM_BINS - 1)
    }

    /// Lower bound of a bin's range.
    fn bin_to_latency(bin: usize) -> u64 {
        if bin == 0 {
            return 1;
        }

        let decade = (bin / 10) as u32;
        let sub_bin = bin % 10;
        10u64.saturating_pow(decade) * sub_bin.max(1) as u64
    }

    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target_count = (total * percentile).div_ceil(100);
        let mut cumulative_count = 0;

        for (bin_idx, bin) in self.bins.iter().enumerate() {
            let bin_count = bin.load(Ordering::Relaxed);
            if bin_count > 0 && cumulative_count + bin_count >= target_count {
                let bin_start = Self::bin_to_latency(bin_idx);
                let bin_end = Self::bin_to_latency(bin_idx + 1).max(bin_start);

                // Linear interpolation inside the bin
                let offset_in_bin = target_count.saturating_sub(cumulative_count);
                let fraction = offset_in_bin as f64 / bin_count as f64;
                let interpolated = bin_start as f64 + fraction * (bin_end - bin_start) as f64;
                return interpolated as u64;
            }
            cumulative_count += bin_count;
        }

        Self::bin_to_latency(NUM_HISTOGRAM_BINS)
    }

    /// Returns `(avg, p50, p95, p99)` in microseconds.
    pub(crate) fn percentiles(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }

        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (
            avg,
            self.estimate_percentile(50),
            self.estimate_percentile(95),
            self.estimate_percentile(99),
        )
    }
}

/// Counters for a single [`Operation`].
#[derive(Debug)]
struct OperationStats {
    count: AtomicU64,
    success_count: AtomicU64,
    failures: [AtomicU64; 4],
    latencies: LatencyHistogram,
}

impl OperationStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failures: std::array::from_fn(|_| AtomicU64::new(0)),
            latencies: LatencyHistogram::new(),
        }
    }

    fn record(&self, outcome: Outcome, latency_us: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Success => {
                self.success_count.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failure(kind) => {
                self.failures[kind.index()].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.latencies.record(latency_us);
    }

    fn snapshot(&self) -> OperationMetrics {
        let failure = |kind: FailureKind| self.failures[kind.index()].load(Ordering::Relaxed);
        let failures = FailureCounts {
            compilation: failure(FailureKind::Compilation),
            runtime: failure(FailureKind::Runtime),
            timeout: failure(FailureKind::Timeout),
            not_found: failure(FailureKind::NotFound),
        };
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.percentiles();

        OperationMetrics {
            count: self.count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: failures.total(),
            failures,
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

/// Lock-free store behind [`crate::ProcessorStats`].
///
/// Every field is an independent atomic updated with relaxed ordering, so a
/// snapshot is a best-effort view rather than a consistent cut.
#[derive(Debug)]
pub struct StatsRegistry {
    compile: OperationStats,
    invoke: OperationStats,
    release: OperationStats,
    expired: AtomicU64,
    dropped: AtomicU64,
    compilations: AtomicU64,
    compile_time_us: AtomicU64,
    invocations: AtomicU64,
    start_time: Instant,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            compile: OperationStats::new(),
            invoke: OperationStats::new(),
            release: OperationStats::new(),
            expired: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
            compile_time_us: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn operation(&self, operation: Operation) -> &OperationStats {
        match operation {
            Operation::Compile => &self.compile,
            Operation::Invoke => &self.invoke,
            Operation::Release => &self.release,
        }
    }

    pub fn record_request(&self, operation: Operation, outcome: Outcome, latency_us: u64) {
        self.operation(operation).record(outcome, latency_us);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compile_time(&self, elapsed_us: u64) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
        self.compile_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    /// Bumps the invocation counter and returns its new value.
    pub fn next_invocation(&self) -> u64 {
        self.invocations.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let compile = self.compile.snapshot();
        let invoke = self.invoke.snapshot();
        let release = self.release.snapshot();
        let compilations = self.compilations.load(Ordering::Relaxed);
        let total_compile_time_us = self.compile_time_us.load(Ordering::Relaxed);

        StatsSnapshot {
            uptime_ms: self.uptime_ms(),
            total_requests: compile.count + invoke.count + release.count,
            expired: self.expired.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            compilations,
            total_compile_time_us,
            avg_compile_time_us: total_compile_time_us.checked_div(compilations).unwrap_or(0),
            compile,
            invoke,
            release,
        }
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
