//! Worker settings from flags, environment and an optional config file.
//!
//! Each setting resolves in order: command-line flag, `JSEXEC_*` environment
//! variable, config file, built-in default.

use anyhow::{anyhow, Context, Result};
use argh::FromArgs;
use jsexec_server::{EngineMode, QueueType, WorkerConfig};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "JSEXEC_";

/// start the script worker; every option falls back to the environment variable in brackets
#[derive(FromArgs, Debug, Default, PartialEq)]
#[argh(subcommand, name = "run")]
pub struct RunArgs {
    /// json config file used as the base layer [JSEXEC_CONFIG]
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// queue backend: memory, kafka, pubsub, aws-sqs, rabbitmq, service-bus [JSEXEC_QUEUE_TYPE]
    #[argh(option, short = 'q')]
    pub queue_type: Option<QueueType>,

    /// topic requests are consumed from [JSEXEC_REQUEST_TOPIC]
    #[argh(option)]
    pub request_topic: Option<String>,

    /// maximum number of cached compiled scripts [JSEXEC_MAX_ACTIVE_SCRIPTS]
    #[argh(option)]
    pub max_active_scripts: Option<usize>,

    /// maximum invoke result length in characters [JSEXEC_MAX_RESULT_SIZE]
    #[argh(option)]
    pub max_result_size: Option<usize>,

    /// requests slower than this many milliseconds are logged [JSEXEC_SLOW_QUERY_LOG_MS]
    #[argh(option)]
    pub slow_query_log_ms: Option<u64>,

    /// include the request body in slow request logs [JSEXEC_SLOW_QUERY_LOG_BODY]
    #[argh(option)]
    pub slow_query_log_body: Option<bool>,

    /// log statistics every N invocations [JSEXEC_STAT_PRINT_FREQUENCY]
    #[argh(option)]
    pub stat_print_frequency: Option<u64>,

    /// log process memory every N invocations, 0 disables [JSEXEC_MEMORY_USAGE_TRACE_FREQUENCY]
    #[argh(option)]
    pub memory_usage_trace_frequency: Option<u64>,

    /// log the invoked script body every N invocations, 0 disables [JSEXEC_SCRIPT_BODY_TRACE_FREQUENCY]
    #[argh(option)]
    pub script_body_trace_frequency: Option<u64>,

    /// engine mode: sandbox or lightweight, or true/false for "use the sandbox" [JSEXEC_USE_SANDBOX]
    #[argh(option)]
    pub engine_mode: Option<EngineMode>,

    /// default execution timeout in milliseconds [JSEXEC_MAX_EXECUTION_TIME_MS]
    #[argh(option)]
    pub max_execution_time_ms: Option<u64>,

    /// compile timeout in milliseconds [JSEXEC_COMPILE_TIMEOUT_MS]
    #[argh(option)]
    pub compile_timeout_ms: Option<u64>,

    /// maximum iterations of a single loop [JSEXEC_LOOP_ITERATION_LIMIT]
    #[argh(option)]
    pub loop_iteration_limit: Option<u64>,

    /// maximum call depth [JSEXEC_RECURSION_LIMIT]
    #[argh(option)]
    pub recursion_limit: Option<usize>,

    /// engine threads allowed to outlive their timeout before work is rejected [JSEXEC_STRAY_THREAD_LIMIT]
    #[argh(option)]
    pub stray_thread_limit: Option<usize>,

    /// engine threads in lightweight mode [JSEXEC_ENGINE_THREADS]
    #[argh(option)]
    pub engine_threads: Option<usize>,

    /// longest a receive waits for messages, in milliseconds [JSEXEC_POLL_INTERVAL_MS]
    #[argh(option)]
    pub poll_interval_ms: Option<u64>,

    /// outbound batch size, overriding the backend default [JSEXEC_BATCH_SIZE]
    #[argh(option)]
    pub batch_size: Option<usize>,

    /// outbound linger in milliseconds, overriding the backend default [JSEXEC_LINGER_MS]
    #[argh(option)]
    pub linger_ms: Option<u64>,

    /// concurrent receive loops [JSEXEC_CONSUMERS]
    #[argh(option)]
    pub consumers: Option<usize>,

    /// kafka bootstrap servers, comma separated [JSEXEC_KAFKA_SERVERS]
    #[argh(option)]
    pub kafka_servers: Option<String>,

    /// kafka consumer group [JSEXEC_KAFKA_GROUP_ID]
    #[argh(option)]
    pub kafka_group_id: Option<String>,

    /// liveness probe bind address [JSEXEC_HTTP_BIND]
    #[argh(option, short = 'b')]
    pub http_bind: Option<SocketAddr>,
}

/// Looks up one environment variable by its full name.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Reads the real process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl RunArgs {
    /// Builds and validates the worker configuration.
    pub fn resolve(self, env: EnvLookup<'_>) -> Result<WorkerConfig> {
        let file = layer(self.config, env, "CONFIG")?;
        let mut config = match file {
            Some(path) => load_file(&path)?,
            None => WorkerConfig::default(),
        };

        config.queue_type = layer(self.queue_type, env, "QUEUE_TYPE")?.unwrap_or(config.queue_type);
        config.request_topic = layer(self.request_topic, env, "REQUEST_TOPIC")?.unwrap_or(config.request_topic);
        config.max_active_scripts =
            layer(self.max_active_scripts, env, "MAX_ACTIVE_SCRIPTS")?.unwrap_or(config.max_active_scripts);
        config.max_result_size =
            layer(self.max_result_size, env, "MAX_RESULT_SIZE")?.unwrap_or(config.max_result_size);
        config.slow_query_log_ms =
            layer(self.slow_query_log_ms, env, "SLOW_QUERY_LOG_MS")?.unwrap_or(config.slow_query_log_ms);
        config.slow_query_log_body =
            layer(self.slow_query_log_body, env, "SLOW_QUERY_LOG_BODY")?.unwrap_or(config.slow_query_log_body);
        config.stat_print_frequency =
            layer(self.stat_print_frequency, env, "STAT_PRINT_FREQUENCY")?.unwrap_or(config.stat_print_frequency);
        config.memory_usage_trace_frequency =
            layer(self.memory_usage_trace_frequency, env, "MEMORY_USAGE_TRACE_FREQUENCY")?
                .unwrap_or(config.memory_usage_trace_frequency);
        config.script_body_trace_frequency =
            layer(self.script_body_trace_frequency, env, "SCRIPT_BODY_TRACE_FREQUENCY")?
                .unwrap_or(config.script_body_trace_frequency);
        config.engine_mode = layer(self.engine_mode, env, "USE_SANDBOX")?.unwrap_or(config.engine_mode);

        if let Some(ms) = layer(self.max_execution_time_ms, env, "MAX_EXECUTION_TIME_MS")? {
            config.limits.execution_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = layer(self.compile_timeout_ms, env, "COMPILE_TIMEOUT_MS")? {
            config.limits.compile_timeout = Duration::from_millis(ms);
        }
        config.limits.loop_iteration_limit =
            layer(self.loop_iteration_limit, env, "LOOP_ITERATION_LIMIT")?.unwrap_or(config.limits.loop_iteration_limit);
        config.limits.recursion_limit =
            layer(self.recursion_limit, env, "RECURSION_LIMIT")?.unwrap_or(config.limits.recursion_limit);
        config.limits.stray_thread_limit = layer(self.stray_thread_limit, env, "STRAY_THREAD_LIMIT")?
            .unwrap_or(config.limits.stray_thread_limit);

        config.engine_threads = layer(self.engine_threads, env, "ENGINE_THREADS")?.unwrap_or(config.engine_threads);
        config.poll_interval_ms =
            layer(self.poll_interval_ms, env, "POLL_INTERVAL_MS")?.unwrap_or(config.poll_interval_ms);
        config.batch_size = layer(self.batch_size, env, "BATCH_SIZE")?.or(config.batch_size);
        config.linger_ms = layer(self.linger_ms, env, "LINGER_MS")?.or(config.linger_ms);
        config.consumers = layer(self.consumers, env, "CONSUMERS")?.unwrap_or(config.consumers);
        config.http_bind = layer(self.http_bind, env, "HTTP_BIND")?.unwrap_or(config.http_bind);
        config.kafka.servers = layer(self.kafka_servers, env, "KAFKA_SERVERS")?.unwrap_or(config.kafka.servers);
        config.kafka.group_id = layer(self.kafka_group_id, env, "KAFKA_GROUP_ID")?.unwrap_or(config.kafka.group_id);

        config
            .validate()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }
}

/// The flag value if given, else the parsed `JSEXEC_<key>` variable.
fn layer<T>(flag: Option<T>, env: EnvLookup<'_>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    if flag.is_some() {
        return Ok(flag);
    }
    let name = format!("{}{}", ENV_PREFIX, key);
    match env(&name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("Invalid value '{}' for {}: {}", raw, name, e)),
        None => Ok(None),
    }
}

fn load_file(path: &Path) -> Result<WorkerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse config file {}", path.display()))
}
