//! Engine thread pool for the lightweight mode.
//!
//! Each pool thread owns one Boa `Context` for its whole life together with a
//! small cache of functions it has already evaluated, keyed by the script's
//! fingerprint. Jobs are handed out over a shared channel, so any idle thread
//! picks up the next one.
//!
//! A job that reaches its deadline is stopped by the thread itself, which
//! then throws its context and function cache away and keeps serving. A job
//! stuck where the deadline is not checked gets its thread retired instead:
//! the caller marks the job abandoned and starts a replacement, and the
//! retired thread counts as a stray until the job returns.

use boa_engine::{Context, JsObject};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::resource_limits::ResourceLimits;
use crate::runtime::context::{self, Deadline};
use crate::runtime::engine::{CompiledScript, StrayThreads, BACKSTOP_GRACE, RUNNING};

/// Evaluated functions kept per thread.
const FUNCTION_CACHE_CAPACITY: usize = 256;

const QUEUED: u8 = 0;

struct Job {
    script: CompiledScript,
    args: Vec<String>,
    deadline: Deadline,
    state: Arc<AtomicU8>,
    reply: oneshot::Sender<Result<String, EngineError>>,
}

pub(crate) struct EnginePool {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    limits: ResourceLimits,
    strays: StrayThreads,
    next_worker: AtomicUsize,
}

impl EnginePool {
    pub(crate) fn new(threads: usize, limits: ResourceLimits, strays: StrayThreads) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pool = Self {
            sender,
            receiver,
            limits,
            strays,
            next_worker: AtomicUsize::new(0),
        };

        for _ in 0..threads.max(1) {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&self) {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let receiver = self.receiver.clone();
        let limits = self.limits.clone();
        let strays = self.strays.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("jsexec-engine-{}", id))
            .spawn(move || worker_loop(receiver, limits, strays));

        if let Err(e) = spawned {
            tracing::error!("Failed to spawn engine thread {}: {}", id, e);
        }
    }

    pub(crate) async fn execute(
        &self,
        script: CompiledScript,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<String, EngineError> {
        self.strays.admit()?;

        let (reply, rx) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(QUEUED));
        let job = Job {
            script,
            args,
            deadline: Deadline::after(timeout),
            state: state.clone(),
            reply,
        };

        self.sender
            .send(job)
            .map_err(|_| EngineError::runtime("Engine pool is shut down"))?;

        match tokio::time::timeout(timeout + BACKSTOP_GRACE, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::runtime("Engine thread exited without a result")),
            Err(_) => {
                if self.strays.abandon(&state) {
                    tracing::warn!(
                        strays = self.strays.count(),
                        "Retiring engine thread stuck past its {:?} deadline",
                        timeout
                    );
                    self.spawn_worker();
                }
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    /// Threads started over the pool's lifetime, replacements included.
    #[cfg(test)]
    fn spawned(&self) -> usize {
        self.next_worker.load(Ordering::Relaxed)
    }
}

fn worker_loop(receiver: Receiver<Job>, limits: ResourceLimits, strays: StrayThreads) {
    let mut ctx = context::new_context(&limits);
    let mut functions = FunctionCache::new(FUNCTION_CACHE_CAPACITY);

    while let Ok(job) = receiver.recv() {
        // Timed out while still queued
        if job
            .state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }

        let result = if job.deadline.passed() {
            Err(EngineError::Timeout(job.deadline.timeout()))
        } else {
            functions
                .get_or_evaluate(&job.script, &mut ctx, job.deadline)
                .and_then(|function| context::call(&function, &job.args, &mut ctx, job.deadline))
        };

        // A run stopped at its deadline leaves frames behind in the context
        if matches!(result, Err(EngineError::Timeout(_))) {
            ctx = context::new_context(&limits);
            functions.clear();
        }
        let _ = job.reply.send(result);

        if strays.finish(&job.state) {
            tracing::info!("Retired engine thread finished its last job");
            break;
        }
    }
}

struct CachedFunction {
    source: Arc<str>,
    function: JsObject,
    last_used: u64,
}

/// Per-thread map from script fingerprint to evaluated function.
struct FunctionCache {
    entries: HashMap<u64, CachedFunction>,
    capacity: usize,
    tick: u64,
}

impl FunctionCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            tick: 0,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn get_or_evaluate(
        &mut self,
        script: &CompiledScript,
        ctx: &mut Context,
        deadline: Deadline,
    ) -> Result<JsObject, EngineError> {
        self.tick += 1;
        let key = script.fingerprint();

        if let Some(entry) = self.entries.get_mut(&key) {
            if Arc::ptr_eq(&entry.source, script.source()) || entry.source == *script.source() {
                entry.last_used = self.tick;
                return Ok(entry.function.clone());
            }
        }

        let function = context::evaluate_function(script.source(), ctx, deadline)?;

        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(
            key,
            CachedFunction {
                source: script.source().clone(),
                function: function.clone(),
                last_used: self.tick,
            },
        );
        Ok(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(body: &str) -> CompiledScript {
        CompiledScript::new(context::wrap(body))
    }

    fn soon() -> Deadline {
        Deadline::after(Duration::from_secs(10))
    }

    fn pool(threads: usize, limits: ResourceLimits) -> EnginePool {
        let strays = StrayThreads::new(limits.stray_thread_limit);
        EnginePool::new(threads, limits, strays)
    }

    #[test]
    fn function_cache_reuses_and_evicts() {
        let mut ctx = context::new_context(&ResourceLimits::default());
        let mut cache = FunctionCache::new(2);

        let a = source("x => 'a'");
        let b = source("x => 'b'");
        let c = source("x => 'c'");

        let first = cache.get_or_evaluate(&a, &mut ctx, soon()).unwrap();
        let again = cache.get_or_evaluate(&a, &mut ctx, soon()).unwrap();
        assert!(JsObject::equals(&first, &again));

        cache.get_or_evaluate(&b, &mut ctx, soon()).unwrap();
        cache.get_or_evaluate(&a, &mut ctx, soon()).unwrap();
        cache.get_or_evaluate(&c, &mut ctx, soon()).unwrap();

        // b was the least recently used
        assert_eq!(cache.entries.len(), 2);
        assert!(cache.entries.contains_key(&a.fingerprint()));
        assert!(!cache.entries.contains_key(&b.fingerprint()));
        assert!(cache.entries.contains_key(&c.fingerprint()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_executes_jobs() {
        let pool = pool(2, ResourceLimits::default());
        let script = source("(a, b) => a * b");

        let result = pool
            .execute(script, vec!["6".into(), "7".into()], Duration::from_secs(5))
            .await;
        assert_eq!(result.unwrap(), "42");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_thread_keeps_serving() {
        let pool = pool(1, ResourceLimits::default());
        // No single frame reaches the loop ceiling
        let spin = source("() => { const f = () => { for (let i = 0; i < 1000; i++) {} }; for (;;) f(); }");
        let quick = source("() => 'still serving'");

        let err = pool
            .execute(spin, vec![], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Timeout(Duration::from_millis(100)));

        let result = pool.execute(quick, vec![], Duration::from_secs(5)).await;
        assert_eq!(result.unwrap(), "still serving");

        // Answered by the original thread, nothing left running
        assert_eq!(pool.spawned(), 1);
        assert_eq!(pool.strays.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn globals_do_not_survive_a_timeout() {
        let pool = pool(1, ResourceLimits::default());
        let set = source("() => { globalThis.marker = 1; for (;;) { [].length; } }");
        let read = source("() => typeof marker");

        let err = pool.execute(set, vec![], Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, EngineError::Timeout(Duration::from_millis(50)));

        let result = pool.execute(read, vec![], Duration::from_secs(5)).await.unwrap();
        assert_eq!(result, "undefined");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn thread_stuck_in_a_callback_is_retired_and_capped() {
        // The callback runs inside a native builtin, out of the deadline's reach,
        // until the loop ceiling ends it.
        let limits = ResourceLimits::default()
            .with_loop_iteration_limit(50_000_000)
            .with_stray_thread_limit(1);
        let pool = pool(1, limits);
        let stuck = source("() => { [1].forEach(() => { for (;;) {} }); }");
        let quick = source("(a) => a");

        let err = pool.execute(stuck, vec![], Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, EngineError::Timeout(Duration::from_millis(20)));
        assert_eq!(pool.spawned(), 2);

        if pool.strays.count() == 1 {
            let rejected = pool.execute(quick.clone(), vec!["1".into()], Duration::from_secs(5)).await;
            assert_eq!(rejected, Err(EngineError::Saturated(1)));
        }

        for _ in 0..2400 {
            if pool.strays.count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(pool.strays.count(), 0);

        let result = pool.execute(quick, vec!["1".into()], Duration::from_secs(5)).await;
        assert_eq!(result.unwrap(), "1");
    }
}
