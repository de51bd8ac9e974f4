//! Dangerous Code Path Integration Tests
//!
//! Scripts that misbehave should fail their own request and nothing else:
//! - Runaway loops and recursion stopped by the runtime ceilings
//! - Repeated errors on reused engine threads
//! - Concurrent executions and single-flight compiles under load

use jsexec::server::{BoaEngine, CacheError, Engine, EngineError, ResourceLimits, ScriptCache};
use jsexec::common::ScriptId;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn engines(limits: ResourceLimits) -> [BoaEngine; 2] {
    [
        BoaEngine::sandboxed(limits.clone()),
        BoaEngine::lightweight(limits, 2),
    ]
}

async fn run(engine: &BoaEngine, body: &str, args: &[&str]) -> Result<String, EngineError> {
    let script = engine.compile(body).await?;
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    engine.execute(&script, &args, None).await
}

// ============================================================================
// Runaway Scripts
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unbounded_recursion_is_a_runtime_error() {
    let limits = ResourceLimits::default().with_recursion_limit(64);
    for engine in engines(limits) {
        let err = run(&engine, "() => { const f = n => f(n + 1); return f(0); }", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime { .. }), "{:?}", err);

        // The engine is still usable afterwards
        assert_eq!(run(&engine, "x => x * 2", &["21"]).await.unwrap(), "42");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_ceiling_stops_before_timeout() {
    let limits = ResourceLimits::default()
        .with_loop_iteration_limit(10_000)
        .with_execution_timeout(Duration::from_secs(30));
    for engine in engines(limits) {
        let err = run(&engine, "() => { let i = 0; while (true) { i++; } }", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime { .. }), "{:?}", err);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runaway_scripts_do_not_starve_the_pool() {
    let limits = ResourceLimits::default().with_execution_timeout(Duration::from_millis(50));
    let engine = BoaEngine::lightweight(limits, 2);

    // More runaways than pool threads
    for _ in 0..4 {
        let err = run(&engine, "() => { for (;;) {} }", &[]).await.unwrap_err();
        assert_eq!(err.error_code(), jsexec::common::ErrorCode::Timeout);
    }

    assert_eq!(run(&engine, "(a, b) => a + b", &["1", "2"]).await.unwrap(), "3");
    assert_eq!(engine.stray_threads(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runaway_spread_over_calls_is_stopped_in_both_modes() {
    let limits = ResourceLimits::default().with_execution_timeout(Duration::from_millis(100));
    let body = "() => { const step = () => { for (let i = 0; i < 500; i++) {} }; while (true) step(); }";
    for engine in engines(limits) {
        for _ in 0..4 {
            let err = run(&engine, body, &[]).await.unwrap_err();
            assert_eq!(err, EngineError::Timeout(Duration::from_millis(100)));
        }
        assert_eq!(engine.stray_threads(), 0);
        assert_eq!(run(&engine, "() => 'ok'", &[]).await.unwrap(), "ok");
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_errors_leave_engine_usable() {
    for engine in engines(ResourceLimits::default()) {
        for _ in 0..10 {
            let err = run(&engine, "() => { throw new Error('Test error'); }", &[])
                .await
                .unwrap_err();
            match err {
                EngineError::Runtime { message, .. } => assert!(message.contains("Test error")),
                other => panic!("expected runtime error, got {:?}", other),
            }
        }

        assert_eq!(run(&engine, "() => 42", &[]).await.unwrap(), "42");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_promise_is_a_runtime_error() {
    for engine in engines(ResourceLimits::default()) {
        let err = run(&engine, "async () => { throw new Error('later'); }", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime { .. }), "{:?}", err);

        assert_eq!(run(&engine, "async x => x + '!'", &["hi"]).await.unwrap(), "hi!");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_complex_data_round_trips_as_json() {
    let body = r#"(args) => ({
        nested: { deep: { value: args.input, array: [1, 2, 3, args.multiplier] } }
    })"#;
    for engine in engines(ResourceLimits::default()) {
        let result = run(&engine, body, &[r#"{"input": "test", "multiplier": 42}"#])
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(
            value,
            json!({ "nested": { "deep": { "value": "test", "array": [1, 2, 3, 42] } } })
        );
    }
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executions() {
    let engine = Arc::new(BoaEngine::lightweight(ResourceLimits::default(), 3));
    let script = engine.compile("(task) => task.id * 10").await.unwrap();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let script = script.clone();
            tokio::spawn(async move {
                let args = vec![json!({ "id": i }).to_string()];
                engine.execute(&script, &args, None).await.unwrap()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), (i * 10).to_string());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolves_compile_once() {
    let engine = Arc::new(BoaEngine::sandboxed(ResourceLimits::default()));
    let cache = Arc::new(ScriptCache::new(engine, 10));
    let id = ScriptId::random();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.resolve(id, Some("x => x")).await.unwrap() })
        })
        .collect();

    let mut compiled = 0;
    for handle in handles {
        if handle.await.unwrap().compile_time.is_some() {
            compiled += 1;
        }
    }
    assert_eq!(compiled, 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_compile_leaves_cache_untouched() {
    let engine = Arc::new(BoaEngine::sandboxed(ResourceLimits::default()));
    let cache = ScriptCache::new(engine, 10);
    let id = ScriptId::random();

    let err = cache.resolve(id, Some("x => {")).await.unwrap_err();
    assert!(matches!(err, CacheError::Compilation(_)), "{:?}", err);
    assert!(cache.is_empty());

    // A later good body for the same id still compiles
    assert!(cache.resolve(id, Some("x => x")).await.is_ok());
    assert!(cache.contains(&id));
}
