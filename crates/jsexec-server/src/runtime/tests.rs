use crate::error::EngineError;
use crate::resource_limits::ResourceLimits;
use crate::runtime::{BoaEngine, Engine, EngineMode};
use std::time::{Duration, Instant};

fn engines() -> Vec<BoaEngine> {
    vec![
        BoaEngine::sandboxed(ResourceLimits::default()),
        BoaEngine::lightweight(ResourceLimits::default(), 2),
    ]
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_increment_in_both_modes() {
    for engine in engines() {
        let script = engine.compile("x => x + 1").await.unwrap();
        let result = engine.execute(&script, &args(&["41"]), None).await.unwrap();
        assert_eq!(result, "42", "mode {}", engine.mode());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_object_results_are_json() {
    for engine in engines() {
        let script = engine
            .compile("(msg, meta) => ({ temperature: msg.temperature * 2, type: meta })")
            .await
            .unwrap();
        let result = engine
            .execute(&script, &args(&[r#"{"temperature":21.5}"#, "POST_TELEMETRY"]), None)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(value["temperature"], 43);
        assert_eq!(value["type"], "POST_TELEMETRY");
    }
}

#[tokio::test]
async fn test_compile_error_carries_line() {
    let engine = BoaEngine::sandboxed(ResourceLimits::default());
    let err = engine
        .compile("function (msg) {\n  return msg +;\n}")
        .await
        .unwrap_err();

    match err {
        EngineError::Compilation { message, .. } => assert!(!message.is_empty()),
        other => panic!("expected compilation error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runtime_error_in_both_modes() {
    for engine in engines() {
        let script = engine.compile("() => undefinedFunction()").await.unwrap();
        let err = engine.execute(&script, &[], None).await.unwrap_err();
        assert!(matches!(err, EngineError::Runtime { .. }), "mode {}: {:?}", engine.mode(), err);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_in_both_modes() {
    for engine in engines() {
        let script = engine.compile("() => { while (true) {} }").await.unwrap();

        let start = Instant::now();
        let err = engine
            .execute(&script, &[], Some(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert_eq!(err, EngineError::Timeout(Duration::from_millis(100)));
        assert!(start.elapsed() < Duration::from_secs(2), "mode {}", engine.mode());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_executions_leave_no_threads_running() {
    // Spread over many short calls so the loop ceiling never fires
    let body = "() => { const f = () => { for (let i = 0; i < 1000; i++) {} }; for (;;) f(); }";
    for engine in engines() {
        let script = engine.compile(body).await.unwrap();

        for _ in 0..8 {
            let err = engine
                .execute(&script, &[], Some(Duration::from_millis(100)))
                .await
                .unwrap_err();
            assert_eq!(err, EngineError::Timeout(Duration::from_millis(100)));
        }

        assert_eq!(engine.stray_threads(), 0, "mode {}", engine.mode());
        let quick = engine.compile("x => x").await.unwrap();
        assert_eq!(engine.execute(&quick, &args(&["7"]), None).await.unwrap(), "7");
    }
}

#[tokio::test]
async fn test_default_timeout_comes_from_limits() {
    let limits = ResourceLimits::default().with_execution_timeout(Duration::from_millis(50));
    let engine = BoaEngine::sandboxed(limits);
    let script = engine.compile("() => { while (true) {} }").await.unwrap();

    let err = engine.execute(&script, &[], None).await.unwrap_err();
    assert_eq!(err, EngineError::Timeout(Duration::from_millis(50)));
}

#[tokio::test]
async fn test_sandbox_does_not_leak_globals() {
    let engine = BoaEngine::sandboxed(ResourceLimits::default());
    let set = engine.compile("() => { globalThis.leaked = 1; return 'set' }").await.unwrap();
    let get = engine.compile("() => typeof leaked").await.unwrap();

    assert_eq!(engine.execute(&set, &[], None).await.unwrap(), "set");
    assert_eq!(engine.execute(&get, &[], None).await.unwrap(), "undefined");
}

#[tokio::test]
async fn test_lightweight_reuses_evaluated_function() {
    // One thread, so the closure state below lives in a single context.
    let engine = BoaEngine::new(EngineMode::Lightweight, ResourceLimits::default(), 1);
    let counter = engine
        .compile("(() => { let n = 0; return () => ++n; })()")
        .await
        .unwrap();

    assert_eq!(engine.execute(&counter, &[], None).await.unwrap(), "1");
    assert_eq!(engine.execute(&counter, &[], None).await.unwrap(), "2");
}

#[tokio::test]
async fn test_undefined_result_is_empty() {
    let engine = BoaEngine::sandboxed(ResourceLimits::default());
    let script = engine.compile("() => {}").await.unwrap();
    assert_eq!(engine.execute(&script, &[], None).await.unwrap(), "");
}
