use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::resource_limits::ResourceLimits;
use crate::runtime::context::{self, Deadline};
use crate::runtime::pool::EnginePool;

/// Extra time the caller waits past a deadline before giving up on a thread.
///
/// Engine threads normally stop themselves at the deadline. The caller only
/// outlasts them when a script is stuck where the deadline is not checked.
pub(crate) const BACKSTOP_GRACE: Duration = Duration::from_millis(250);

pub(crate) const RUNNING: u8 = 1;
const DONE: u8 = 2;
const ABANDONED: u8 = 3;

/// Counts engine threads still busy with a job their caller abandoned.
#[derive(Debug, Clone)]
pub(crate) struct StrayThreads {
    count: Arc<AtomicUsize>,
    limit: usize,
}

impl StrayThreads {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Refuses new work while the ceiling is reached.
    pub(crate) fn admit(&self) -> Result<(), EngineError> {
        let count = self.count();
        if count >= self.limit {
            return Err(EngineError::Saturated(count));
        }
        Ok(())
    }

    /// Called by the waiting side once it stops waiting for `state`.
    ///
    /// Returns true when the thread is still running the job and now counts
    /// as a stray.
    pub(crate) fn abandon(&self, state: &AtomicU8) -> bool {
        // Counted before the swap so the thread's release never runs first.
        self.count.fetch_add(1, Ordering::AcqRel);
        if state.swap(ABANDONED, Ordering::AcqRel) == RUNNING {
            true
        } else {
            self.count.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    /// Called by the engine thread when its job returns.
    ///
    /// Returns true when the job had been abandoned in the meantime.
    pub(crate) fn finish(&self, state: &AtomicU8) -> bool {
        let abandoned = state
            .compare_exchange(RUNNING, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_err();
        if abandoned {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        abandoned
    }
}

/// Compiles script bodies into handles and executes them.
///
/// The processor and cache are generic over this trait so they can be driven
/// by something other than Boa in tests.
pub trait Engine: Send + Sync + 'static {
    /// Handle produced by a successful compile. Cloning must be cheap.
    type Script: Clone + Send + Sync + 'static;

    /// Checks a body and produces a handle for it.
    fn compile(&self, body: &str) -> impl Future<Output = Result<Self::Script, EngineError>> + Send;

    /// Runs a handle against positional string arguments.
    ///
    /// `timeout` of `None` means the engine's configured default.
    fn execute(
        &self,
        script: &Self::Script,
        args: &[String],
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<String, EngineError>> + Send;
}

/// How [`BoaEngine`] isolates executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Fresh context per execution.
    #[default]
    Sandbox,
    /// Long-lived contexts reused across executions.
    Lightweight,
}

impl FromStr for EngineMode {
    type Err = String;

    /// Accepts the mode name, or a boolean answering "use the sandbox?".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" | "true" => Ok(EngineMode::Sandbox),
            "lightweight" | "false" => Ok(EngineMode::Lightweight),
            other => Err(format!(
                "unknown engine mode '{}' (expected sandbox or lightweight)",
                other
            )),
        }
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineMode::Sandbox => f.write_str("sandbox"),
            EngineMode::Lightweight => f.write_str("lightweight"),
        }
    }
}

/// A syntax-checked script, ready to run.
///
/// Holds the wrapped source rather than engine objects: Boa values are tied
/// to the thread and context that created them, so each execution context
/// evaluates the source itself.
#[derive(Clone)]
pub struct CompiledScript {
    inner: Arc<ScriptSource>,
}

pub(crate) struct ScriptSource {
    pub(crate) source: Arc<str>,
    pub(crate) fingerprint: u64,
}

impl CompiledScript {
    pub(crate) fn new(source: String) -> Self {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        Self {
            inner: Arc::new(ScriptSource {
                fingerprint: hasher.finish(),
                source: source.into(),
            }),
        }
    }

    pub(crate) fn source(&self) -> &Arc<str> {
        &self.inner.source
    }

    /// Hash of the wrapped source, used to key per-thread function caches.
    pub fn fingerprint(&self) -> u64 {
        self.inner.fingerprint
    }

    /// Whether two handles share the same allocation.
    pub fn ptr_eq(&self, other: &CompiledScript) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledScript")
            .field("fingerprint", &format_args!("{:016x}", self.inner.fingerprint))
            .field("len", &self.inner.source.len())
            .finish()
    }
}

/// Runs `job` on a dedicated thread under a deadline of `timeout`.
///
/// The job is expected to stop itself at the deadline. If it has not
/// answered [`BACKSTOP_GRACE`] later, the thread is counted as a stray until
/// it finishes and the caller gets a timeout.
pub(crate) async fn run_on_thread<T, F>(
    name: &str,
    timeout: Duration,
    strays: &StrayThreads,
    job: F,
) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce(Deadline) -> Result<T, EngineError> + Send + 'static,
{
    strays.admit()?;

    let (tx, rx) = oneshot::channel();
    let deadline = Deadline::after(timeout);
    let state = Arc::new(AtomicU8::new(RUNNING));
    let thread_state = state.clone();
    let thread_strays = strays.clone();

    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(job(deadline));
            if thread_strays.finish(&thread_state) {
                tracing::info!("Stray engine thread finished");
            }
        })
        .map_err(|e| EngineError::runtime(format!("Failed to spawn {} thread: {}", name, e)))?;

    match tokio::time::timeout(timeout + BACKSTOP_GRACE, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(EngineError::runtime(format!(
            "{} thread exited without a result",
            name
        ))),
        Err(_) => {
            if strays.abandon(&state) {
                tracing::warn!(
                    strays = strays.count(),
                    "{} thread did not stop at its {:?} deadline",
                    name,
                    timeout
                );
            }
            Err(EngineError::Timeout(timeout))
        }
    }
}

/// [`Engine`] backed by the Boa JavaScript interpreter.
///
/// # Modes
///
/// - [`EngineMode::Sandbox`]: each execution builds a fresh `Context` on its
///   own short-lived thread, so nothing leaks between calls.
/// - [`EngineMode::Lightweight`]: a fixed pool of engine threads, each keeping
///   one `Context` and the functions it has already evaluated. Much cheaper
///   per call, but scripts share global state within a thread.
///
/// Compilation is a syntax check run under `compile_timeout` in both modes.
///
/// Executions stop themselves at their timeout. A thread that cannot (a
/// script spinning inside a native callback) becomes a stray; once
/// `stray_thread_limit` strays are alive new work fails with
/// [`EngineError::Saturated`] until they finish.
///
/// # Example
///
/// ```no_run
/// use jsexec_server::{BoaEngine, Engine, ResourceLimits};
///
/// # async fn demo() -> Result<(), jsexec_server::EngineError> {
/// let engine = BoaEngine::sandboxed(ResourceLimits::default());
/// let script = engine.compile("x => x + 1").await?;
/// let result = engine.execute(&script, &["41".to_string()], None).await?;
/// assert_eq!(result, "42");
/// # Ok(())
/// # }
/// ```
pub struct BoaEngine {
    mode: EngineMode,
    limits: ResourceLimits,
    strays: StrayThreads,
    pool: Option<EnginePool>,
}

impl BoaEngine {
    pub fn new(mode: EngineMode, limits: ResourceLimits, threads: usize) -> Self {
        let strays = StrayThreads::new(limits.stray_thread_limit);
        let pool = match mode {
            EngineMode::Sandbox => None,
            EngineMode::Lightweight => {
                Some(EnginePool::new(threads, limits.clone(), strays.clone()))
            }
        };
        Self {
            mode,
            limits,
            strays,
            pool,
        }
    }

    pub fn sandboxed(limits: ResourceLimits) -> Self {
        Self::new(EngineMode::Sandbox, limits, 0)
    }

    pub fn lightweight(limits: ResourceLimits, threads: usize) -> Self {
        Self::new(EngineMode::Lightweight, limits, threads)
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Threads still running a script whose caller already got a timeout.
    pub fn stray_threads(&self) -> usize {
        self.strays.count()
    }
}

impl Engine for BoaEngine {
    type Script = CompiledScript;

    async fn compile(&self, body: &str) -> Result<CompiledScript, EngineError> {
        let source = context::wrap(body);
        let limits = self.limits.clone();

        run_on_thread("jsexec-compile", self.limits.compile_timeout, &self.strays, move |_| {
            let mut ctx = context::new_context(&limits);
            context::check_syntax(&source, &mut ctx)?;
            Ok(CompiledScript::new(source))
        })
        .await
    }

    async fn execute(
        &self,
        script: &CompiledScript,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<String, EngineError> {
        let timeout = timeout.unwrap_or(self.limits.execution_timeout);

        if let Some(pool) = &self.pool {
            return pool.execute(script.clone(), args.to_vec(), timeout).await;
        }

        let source = script.source().clone();
        let args = args.to_vec();
        let limits = self.limits.clone();
        run_on_thread("jsexec-sandbox", timeout, &self.strays, move |deadline| {
            let mut ctx = context::new_context(&limits);
            let function = context::evaluate_function(&source, &mut ctx, deadline)?;
            context::call(&function, &args, &mut ctx, deadline)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_mode_parses_names_and_flags() {
        assert_eq!("sandbox".parse::<EngineMode>().unwrap(), EngineMode::Sandbox);
        assert_eq!("Lightweight".parse::<EngineMode>().unwrap(), EngineMode::Lightweight);
        assert_eq!("true".parse::<EngineMode>().unwrap(), EngineMode::Sandbox);
        assert_eq!("false".parse::<EngineMode>().unwrap(), EngineMode::Lightweight);
        assert!("isolated".parse::<EngineMode>().is_err());
    }

    #[test]
    fn fingerprint_follows_source() {
        let a = CompiledScript::new(context::wrap("x => x"));
        let b = CompiledScript::new(context::wrap("x => x"));
        let c = CompiledScript::new(context::wrap("x => x + 1"));

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&a.clone()));
    }

    #[tokio::test]
    async fn run_on_thread_honours_the_deadline() {
        let strays = StrayThreads::new(4);
        let result = run_on_thread("test-deadline", Duration::from_millis(20), &strays, |deadline| {
            while !deadline.passed() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err::<(), _>(EngineError::Timeout(deadline.timeout()))
        })
        .await;

        assert_eq!(result, Err(EngineError::Timeout(Duration::from_millis(20))));
        assert_eq!(strays.count(), 0);
    }

    #[tokio::test]
    async fn stray_threads_are_capped_and_released() {
        let strays = StrayThreads::new(1);
        let (release, wait) = std::sync::mpsc::channel::<()>();

        // Ignores its deadline until released
        let result = run_on_thread("test-stray", Duration::from_millis(20), &strays, move |_| {
            let _ = wait.recv();
            Ok(())
        })
        .await;
        assert_eq!(result, Err(EngineError::Timeout(Duration::from_millis(20))));
        assert_eq!(strays.count(), 1);

        let rejected = run_on_thread("test-rejected", Duration::from_secs(1), &strays, |_| Ok(())).await;
        assert_eq!(rejected, Err(EngineError::Saturated(1)));

        release.send(()).unwrap();
        for _ in 0..100 {
            if strays.count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(strays.count(), 0);
        assert!(run_on_thread("test-after", Duration::from_secs(1), &strays, |_| Ok(())).await.is_ok());
    }
}
