//! In-crate test doubles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::runtime::Engine;

/// Handle produced by [`FakeEngine`]: the body plus a serial number unique
/// to each compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeScript {
    pub body: Arc<str>,
    pub serial: usize,
}

/// Engine that counts compiles and interprets a tiny command language:
///
/// - a body containing `syntax error` fails to compile
/// - `repeat:N` returns `N` copies of `x`
/// - `sleep:N` waits `N` milliseconds, then echoes its arguments
/// - `fail` fails at runtime, `hang` times out
/// - anything else echoes its arguments joined by `,`
#[derive(Debug, Default)]
pub(crate) struct FakeEngine {
    compiles: AtomicUsize,
    executions: AtomicUsize,
    compile_delay: Duration,
}

impl FakeEngine {
    pub fn with_compile_delay(delay: Duration) -> Self {
        Self {
            compile_delay: delay,
            ..Default::default()
        }
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl Engine for FakeEngine {
    type Script = FakeScript;

    async fn compile(&self, body: &str) -> Result<FakeScript, EngineError> {
        let serial = self.compiles.fetch_add(1, Ordering::SeqCst);
        if !self.compile_delay.is_zero() {
            tokio::time::sleep(self.compile_delay).await;
        }
        if body.contains("syntax error") {
            return Err(EngineError::Compilation {
                message: "SyntaxError: unexpected token".into(),
                line: Some(1),
            });
        }
        Ok(FakeScript {
            body: body.into(),
            serial,
        })
    }

    async fn execute(
        &self,
        script: &FakeScript,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<String, EngineError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let body = &*script.body;

        if let Some(n) = body.strip_prefix("repeat:") {
            let n: usize = n.trim().parse().map_err(|_| EngineError::runtime("bad repeat"))?;
            return Ok("x".repeat(n));
        }
        if let Some(ms) = body.strip_prefix("sleep:") {
            let ms: u64 = ms.trim().parse().map_err(|_| EngineError::runtime("bad sleep"))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(args.join(","));
        }
        match body {
            "fail" => Err(EngineError::Runtime {
                message: "Error: boom".into(),
                line: Some(2),
            }),
            "hang" => Err(EngineError::Timeout(timeout.unwrap_or(Duration::from_secs(30)))),
            _ => Ok(args.join(",")),
        }
    }
}
