//! Bounded cache of compiled scripts.
//!
//! Entries are ranked by how often they have been invoked, not by recency:
//! when the cache grows past its bound, the entry with the fewest invocations
//! goes first, ties going to the entry inserted earliest. The entry inserted
//! last is never a candidate, so a burst of new scripts cannot evict the one
//! that was just compiled for the request in hand.
//!
//! # Concurrency
//!
//! - Hits take a shared read lock and bump an atomic counter, so lookups of
//!   unrelated scripts never wait on each other.
//! - Inserts, releases and evictions take the write lock, which also guards
//!   the insertion order.
//! - Compiles are single-flight per identifier: concurrent misses for the
//!   same script queue on a per-identifier async mutex and re-check the cache
//!   once they hold it, so only the first one compiles.

use jsexec_common::ScriptId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CacheError;
use crate::runtime::Engine;

struct CacheEntry<S> {
    handle: S,
    invocations: AtomicU64,
}

struct CacheState<S> {
    entries: HashMap<ScriptId, CacheEntry<S>>,
    /// Identifiers in insertion order; the last one is exempt from eviction.
    order: Vec<ScriptId>,
}

impl<S> CacheState<S> {
    /// Removes the least-invoked entry other than the newest one.
    fn evict_one(&mut self) -> Option<ScriptId> {
        let candidates = self.order.len().checked_sub(1)?;
        let (index, _) = self.order[..candidates]
            .iter()
            .enumerate()
            .min_by_key(|(_, id)| {
                self.entries
                    .get(*id)
                    .map(|e| e.invocations.load(Ordering::Relaxed))
                    .unwrap_or(0)
            })?;

        let id = self.order.remove(index);
        self.entries.remove(&id);
        Some(id)
    }
}

/// Outcome of [`ScriptCache::resolve`].
#[derive(Debug, Clone)]
pub struct Resolved<S> {
    pub script: S,
    /// Time spent compiling, when this call compiled the script.
    pub compile_time: Option<Duration>,
}

type CompileGate = Arc<tokio::sync::Mutex<()>>;

/// Bounded, invocation-ranked cache of compiled script handles.
pub struct ScriptCache<E: Engine> {
    engine: Arc<E>,
    max_entries: usize,
    state: RwLock<CacheState<E::Script>>,
    inflight: Mutex<HashMap<ScriptId, CompileGate>>,
}

impl<E: Engine> ScriptCache<E> {
    pub fn new(engine: Arc<E>, max_entries: usize) -> Self {
        Self {
            engine,
            max_entries,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ScriptId) -> bool {
        self.state.read().entries.contains_key(id)
    }

    /// Current invocation count of a cached script.
    pub fn invocation_count(&self, id: &ScriptId) -> Option<u64> {
        self.state
            .read()
            .entries
            .get(id)
            .map(|e| e.invocations.load(Ordering::Relaxed))
    }

    /// Returns the handle for `id`, compiling `body` on a miss.
    ///
    /// # Errors
    ///
    /// - [`CacheError::NotFound`] on a miss with no body
    /// - [`CacheError::Compilation`] when the body fails to compile; the cache
    ///   is left unchanged
    pub async fn get_or_compile(
        &self,
        id: ScriptId,
        body: Option<&str>,
    ) -> Result<E::Script, CacheError> {
        self.resolve(id, body).await.map(|resolved| resolved.script)
    }

    /// Like [`get_or_compile`](Self::get_or_compile), also reporting whether
    /// this call did the compiling.
    pub async fn resolve(
        &self,
        id: ScriptId,
        body: Option<&str>,
    ) -> Result<Resolved<E::Script>, CacheError> {
        if let Some(script) = self.hit(&id) {
            return Ok(Resolved {
                script,
                compile_time: None,
            });
        }

        let Some(body) = body else {
            return Err(CacheError::NotFound(id));
        };

        let gate = InflightGuard::enter(&self.inflight, id);
        let _permit = gate.gate.lock().await;

        // Another caller may have compiled it while we queued.
        if let Some(script) = self.hit(&id) {
            return Ok(Resolved {
                script,
                compile_time: None,
            });
        }

        let start = Instant::now();
        let script = self
            .engine
            .compile(body)
            .await
            .map_err(CacheError::Compilation)?;
        let compile_time = start.elapsed();

        self.insert(id, script.clone());
        tracing::debug!(script_id = %id, ?compile_time, "Compiled script");

        Ok(Resolved {
            script,
            compile_time: Some(compile_time),
        })
    }

    fn hit(&self, id: &ScriptId) -> Option<E::Script> {
        let state = self.state.read();
        let entry = state.entries.get(id)?;
        // Saturating increment
        let _ = entry
            .invocations
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1));
        Some(entry.handle.clone())
    }

    /// Adds a fresh entry, evicting until the bound holds again.
    ///
    /// Inserting an identifier that is already cached swaps its handle and
    /// keeps its invocation count and position.
    pub fn insert(&self, id: ScriptId, handle: E::Script) {
        let mut state = self.state.write();

        if let Some(entry) = state.entries.get_mut(&id) {
            entry.handle = handle;
            return;
        }

        state.entries.insert(
            id,
            CacheEntry {
                handle,
                invocations: AtomicU64::new(0),
            },
        );
        state.order.push(id);

        while state.entries.len() > self.max_entries {
            match state.evict_one() {
                Some(evicted) => tracing::debug!(script_id = %evicted, "Evicted script"),
                None => break,
            }
        }
    }

    /// Drops the entry for `id`. Returns whether one was present.
    pub fn release(&self, id: &ScriptId) -> bool {
        let mut state = self.state.write();
        if state.entries.remove(id).is_none() {
            return false;
        }
        state.order.retain(|other| other != id);
        true
    }
}

/// Holds a reference to the per-identifier compile gate and removes the gate
/// from the map once no other caller is queued on it.
struct InflightGuard<'a> {
    map: &'a Mutex<HashMap<ScriptId, CompileGate>>,
    id: ScriptId,
    gate: CompileGate,
}

impl<'a> InflightGuard<'a> {
    fn enter(map: &'a Mutex<HashMap<ScriptId, CompileGate>>, id: ScriptId) -> Self {
        let gate = map.lock().entry(id).or_default().clone();
        Self { map, id, gate }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        // One reference in the map plus ours means nobody else is waiting.
        if Arc::strong_count(&self.gate) <= 2 {
            if let Some(current) = map.get(&self.id) {
                if Arc::ptr_eq(current, &self.gate) {
                    map.remove(&self.id);
                }
            }
        }
    }
}
