//! Worker process lifecycle: build, serve, wait for a stop signal, tear down.

use anyhow::{anyhow, Context, Result};
use jsexec_metrics::ProcessorStats;
use jsexec_server::http_server::HttpServer;
use jsexec_server::{
    BoaEngine, Broker, Engine, MemoryBroker, QueueAdapter, QueueType, ScriptCache, WorkerConfig,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Why the worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Signal(&'static str),
    Fatal(String),
}

impl StopReason {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            StopReason::Signal(_) => ExitCode::SUCCESS,
            StopReason::Fatal(_) => ExitCode::FAILURE,
        }
    }
}

/// Runs the worker until SIGINT/SIGTERM or a fatal broker error.
pub async fn run(config: WorkerConfig) -> Result<StopReason> {
    tracing::info!(
        queue = %config.queue_type,
        topic = %config.request_topic,
        engine_mode = %config.engine_mode,
        max_active_scripts = config.max_active_scripts,
        "Starting jsexec worker"
    );

    let engine = Arc::new(config.build_engine());
    match config.queue_type {
        QueueType::Memory => {
            let broker = Arc::new(MemoryBroker::new());
            run_with(broker, engine, &config, shutdown_signal()).await
        }
        QueueType::Kafka => run_kafka(engine, &config).await,
        other => Err(anyhow!(
            "Queue type '{}' has no built-in broker; embed jsexec-server and supply a Broker implementation",
            other
        )),
    }
}

#[cfg(feature = "kafka")]
async fn run_kafka(engine: Arc<BoaEngine>, config: &WorkerConfig) -> Result<StopReason> {
    let broker = Arc::new(jsexec_server::KafkaBroker::new(config.kafka.clone()));
    run_with(broker, engine, config, shutdown_signal()).await
}

#[cfg(not(feature = "kafka"))]
async fn run_kafka(_engine: Arc<BoaEngine>, _config: &WorkerConfig) -> Result<StopReason> {
    Err(anyhow!(
        "Queue type 'kafka' needs the Kafka broker; rebuild jsexec with `--features kafka`"
    ))
}

/// Runs the worker on an explicit broker and engine until `stop` resolves or
/// the adapter reports a fatal error.
pub async fn run_with<B, E, F>(
    broker: Arc<B>,
    engine: Arc<E>,
    config: &WorkerConfig,
    stop: F,
) -> Result<StopReason>
where
    B: Broker,
    E: Engine,
    F: std::future::Future<Output = &'static str>,
{
    let stats = ProcessorStats::new();
    let cache = Arc::new(ScriptCache::new(engine, config.max_active_scripts));
    let adapter = QueueAdapter::new(
        broker,
        cache,
        stats.clone(),
        config.adapter_config(),
        config.processor_config(),
    );

    let listener = TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("Failed to bind liveness server to {}", config.http_bind))?;
    let http = tokio::spawn(HttpServer::new(stats).serve(listener));

    if let Err(e) = adapter.init().await {
        http.abort();
        adapter.destroy().await;
        return Err(anyhow!("Failed to start queue adapter: {}", e));
    }

    let reason = tokio::select! {
        signal = stop => {
            tracing::info!("Received {}, shutting down", signal);
            StopReason::Signal(signal)
        }
        fatal = adapter.wait_fatal() => {
            tracing::error!("Fatal broker error, shutting down: {}", fatal);
            StopReason::Fatal(fatal)
        }
    };

    adapter.destroy().await;
    http.abort();

    let snapshot = adapter.stats().snapshot();
    tracing::info!(
        requests = snapshot.total_requests,
        expired = snapshot.expired,
        dropped = snapshot.dropped,
        uptime_ms = snapshot.uptime_ms,
        "Worker stopped"
    );
    Ok(reason)
}

/// Resolves with the signal name on SIGINT or SIGTERM.
pub async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = term.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

/// Compiles `body` and runs it once against `args` on a sandboxed engine.
pub async fn eval_once(engine: &BoaEngine, body: &str, args: &[String]) -> Result<String> {
    let script = engine.compile(body).await?;
    let result = engine.execute(&script, args, None).await?;
    Ok(result)
}
