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

use serde::{Deserialize, Serialize};

/// Failed requests split by error code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    pub compilation: u64,
    pub runtime: u64,
    pub timeout: u64,
    pub not_found: u64,
}

impl FailureCounts {
    pub fn total(&self) -> u64 {
        self.compilation + self.runtime + self.timeout + self.not_found
    }
}

/// Metrics for one request kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub failures: FailureCounts,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Point-in-time view of a worker's statistics.
///
/// Served as JSON by the `/metrics` endpoint and summarised in the periodic
/// stats log line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_ms: u64,
    pub total_requests: u64,
    /// Messages skipped because their expiry had passed.
    pub expired: u64,
    /// Messages skipped because they could not be decoded.
    pub dropped: u64,
    /// Scripts compiled (cache misses), with the time spent compiling them.
    pub compilations: u64,
    pub total_compile_time_us: u64,
    pub avg_compile_time_us: u64,
    pub compile: OperationMetrics,
    pub invoke: OperationMetrics,
    pub release: OperationMetrics,
}
