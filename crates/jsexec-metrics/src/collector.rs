// Copyright 2025 jsexec Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::registry::{FailureKind, Operation, Outcome, StatsRegistry};
use crate::snapshot::StatsSnapshot;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Statistics collected by a request processor.
///
/// `ProcessorStats` is a cheap handle over a shared [`StatsRegistry`]; clones
/// record into the same counters, so the processor and the liveness server
/// can each hold one.
///
/// # Example
///
/// ```rust
/// use jsexec_metrics::{Operation, Outcome, ProcessorStats};
/// use std::time::Instant;
///
/// let stats = ProcessorStats::new();
/// let start = Instant::now();
/// // ... handle an invoke request ...
/// stats.record_request(Operation::Invoke, start, Outcome::Success);
///
/// assert_eq!(stats.snapshot().invoke.count, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    registry: Arc<StatsRegistry>,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<StatsRegistry>) -> Self {
        Self { registry }
    }

    /// Records a handled request, timing it from `start`.
    pub fn record_request(&self, operation: Operation, start: Instant, outcome: Outcome) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.registry.record_request(operation, outcome, latency_us);
    }

    pub fn record_failure(&self, operation: Operation, start: Instant, kind: FailureKind) {
        self.record_request(operation, start, Outcome::Failure(kind));
    }

    /// Records a message that was skipped because its expiry passed.
    pub fn record_expired(&self) {
        self.registry.record_expired();
    }

    /// Records a message that was skipped because it could not be decoded.
    pub fn record_dropped(&self) {
        self.registry.record_dropped();
    }

    /// Records the time spent compiling a script that was not yet cached.
    pub fn record_compile_time(&self, elapsed: Duration) {
        self.registry.record_compile_time(elapsed.as_micros() as u64);
    }

    /// Counts one more invocation and returns the running total.
    ///
    /// Callers use the returned value to decide whether a periodic log line
    /// is due (`count % frequency == 0`).
    pub fn record_invocation(&self) -> u64 {
        self.registry.next_invocation()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.registry.uptime_ms()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.registry.snapshot()
    }
}
