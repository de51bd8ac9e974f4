//! Worker configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::processor::ProcessorConfig;
use crate::queue::{AdapterConfig, BackendProfile, KafkaSettings, QueueType};
use crate::resource_limits::ResourceLimits;
use crate::runtime::{BoaEngine, EngineMode};

pub const DEFAULT_REQUEST_TOPIC: &str = "js_eval.requests";
pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8888";

/// Everything a worker process needs to start.
///
/// Deserializes with every field optional; missing fields take the
/// [`Default`] values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_type: QueueType,
    pub request_topic: String,
    /// Upper bound on cached compiled scripts.
    pub max_active_scripts: usize,
    /// Longest invoke result, in characters.
    pub max_result_size: usize,
    pub slow_query_log_ms: u64,
    pub slow_query_log_body: bool,
    pub stat_print_frequency: u64,
    pub memory_usage_trace_frequency: u64,
    pub script_body_trace_frequency: u64,
    pub engine_mode: EngineMode,
    pub limits: ResourceLimits,
    /// Engine threads in lightweight mode.
    pub engine_threads: usize,
    pub poll_interval_ms: u64,
    /// Overrides the backend profile's outbound batch size.
    pub batch_size: Option<usize>,
    /// Overrides the backend profile's linger.
    pub linger_ms: Option<u64>,
    pub consumers: usize,
    pub http_bind: SocketAddr,
    /// Used when `queue_type` is `kafka`.
    pub kafka: KafkaSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_type: QueueType::default(),
            request_topic: DEFAULT_REQUEST_TOPIC.to_string(),
            max_active_scripts: 1000,
            max_result_size: 300_000,
            slow_query_log_ms: 5000,
            slow_query_log_body: false,
            stat_print_frequency: 10_000,
            memory_usage_trace_frequency: 0,
            script_body_trace_frequency: 0,
            engine_mode: EngineMode::default(),
            limits: ResourceLimits::default(),
            engine_threads: default_engine_threads(),
            poll_interval_ms: 25,
            batch_size: None,
            linger_ms: None,
            consumers: 1,
            http_bind: SocketAddr::from(([0, 0, 0, 0], 8888)),
            kafka: KafkaSettings::default(),
        }
    }
}

impl WorkerConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_topic.trim().is_empty() {
            return Err("request topic must not be empty".into());
        }
        if self.max_active_scripts == 0 {
            return Err("max_active_scripts must be at least 1".into());
        }
        if self.max_result_size == 0 {
            return Err("max_result_size must be at least 1".into());
        }
        if self.engine_mode == EngineMode::Lightweight && self.engine_threads == 0 {
            return Err("engine_threads must be at least 1 in lightweight mode".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be at least 1".into());
        }
        if self.batch_size == Some(0) {
            return Err("batch_size must be at least 1".into());
        }
        if self.consumers == 0 {
            return Err("consumers must be at least 1".into());
        }
        if self.queue_type == QueueType::Kafka {
            self.kafka.validate()?;
        }
        self.limits.validate()
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            max_result_size: self.max_result_size,
            slow_query_threshold: Duration::from_millis(self.slow_query_log_ms),
            slow_query_log_body: self.slow_query_log_body,
            stat_print_frequency: self.stat_print_frequency,
            memory_usage_trace_frequency: self.memory_usage_trace_frequency,
            script_body_trace_frequency: self.script_body_trace_frequency,
        }
    }

    /// The profile of the selected backend with the batch overrides applied.
    pub fn backend_profile(&self) -> BackendProfile {
        let mut profile = BackendProfile::for_queue(self.queue_type);
        if let Some(size) = self.batch_size {
            profile = profile.with_send_batch_size(size);
        }
        if let Some(linger) = self.linger_ms {
            profile = profile.with_linger(Duration::from_millis(linger));
        }
        profile
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            request_topic: self.request_topic.clone(),
            profile: self.backend_profile(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            consumers: self.consumers,
        }
    }

    pub fn build_engine(&self) -> BoaEngine {
        BoaEngine::new(self.engine_mode, self.limits.clone(), self.engine_threads)
    }
}

fn default_engine_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
