//! Heap bookkeeping for an isolate.
//!
//! Every scope allocated in an isolate is registered here as a weak entry.
//! A collection sweeps entries whose scope has been dropped; idle
//! notifications do the same work in small batches and report when nothing
//! is left to do. Registration also sweeps each time the registry has
//! doubled since the last sweep, so it stays bounded without collections.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::context::ScopeCell;

/// Entries examined per idle notification.
const IDLE_BATCH: usize = 32;

/// Registry size that triggers the first sweep on registration.
const MIN_SWEEP_AT: usize = 64;

/// Snapshot of an isolate's heap bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStatistics {
    /// Scopes still referenced by at least one `Context`
    pub live_contexts: usize,
    /// Registry entries not yet swept (live + dead)
    pub tracked_contexts: usize,
    /// Total scopes reclaimed by collections and idle notifications
    pub collected_contexts: u64,
    /// Number of full collections performed
    pub full_collections: u64,
    /// Whether a data-size limit was hit in this isolate
    pub memory_limit_hit: bool,
}

struct Registry {
    scopes: Vec<Weak<ScopeCell>>,
    idle_cursor: usize,
    /// Entries reclaimed so far in the current idle pass
    pass_reclaimed: usize,
    sweep_at: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            scopes: Vec::new(),
            idle_cursor: 0,
            pass_reclaimed: 0,
            sweep_at: MIN_SWEEP_AT,
        }
    }
}

impl Registry {
    /// Drop dead entries. Restarts any idle pass, since indices move.
    fn sweep(&mut self) -> usize {
        let before = self.scopes.len();

        self.scopes.retain(|scope| scope.strong_count() > 0);
        self.idle_cursor = 0;
        self.pass_reclaimed = 0;
        self.sweep_at = (self.scopes.len() * 2).max(MIN_SWEEP_AT);

        before - self.scopes.len()
    }
}

pub(crate) struct Heap {
    registry: Mutex<Registry>,
    /// Set once the isolate has allocated (first scope or compile)
    used: AtomicBool,
    /// Script-visible `gc()` is enabled
    expose_gc: AtomicBool,
    memory_limit_hit: Arc<AtomicBool>,
    collected: AtomicU64,
    full_collections: AtomicU64,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            used: AtomicBool::new(false),
            expose_gc: AtomicBool::new(false),
            memory_limit_hit: Arc::new(AtomicBool::new(false)),
            collected: AtomicU64::new(0),
            full_collections: AtomicU64::new(0),
        }
    }

    pub(crate) fn mark_used(&self) {
        self.used.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }

    pub(crate) fn register_scope(&self, scope: &Arc<ScopeCell>) {
        self.mark_used();

        let mut registry = self.registry.lock();

        if registry.scopes.len() >= registry.sweep_at {
            let reclaimed = registry.sweep();
            self.collected.fetch_add(reclaimed as u64, Ordering::Relaxed);
        }

        registry.scopes.push(Arc::downgrade(scope));
    }

    pub(crate) fn expose_gc(&self) {
        self.expose_gc.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_gc_exposed(&self) -> bool {
        self.expose_gc.load(Ordering::SeqCst)
    }

    pub(crate) fn flag_memory_limit(&self) {
        self.memory_limit_hit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn memory_limit_hit(&self) -> bool {
        self.memory_limit_hit.load(Ordering::SeqCst)
    }

    /// Sweep every dead entry. Returns the number reclaimed.
    pub(crate) fn full_collection(&self) -> usize {
        let reclaimed = self.registry.lock().sweep();

        self.collected.fetch_add(reclaimed as u64, Ordering::Relaxed);
        self.full_collections.fetch_add(1, Ordering::Relaxed);

        reclaimed
    }

    /// Sweep one batch of entries.
    ///
    /// Returns true once a complete pass over the registry reclaimed nothing.
    pub(crate) fn idle_notification(&self) -> bool {
        let mut registry = self.registry.lock();
        let mut index = registry.idle_cursor;
        let mut reclaimed = 0;

        for _ in 0..IDLE_BATCH {
            if index >= registry.scopes.len() {
                break;
            }

            if registry.scopes[index].strong_count() == 0 {
                registry.scopes.swap_remove(index);
                reclaimed += 1;
            } else {
                index += 1;
            }
        }

        registry.pass_reclaimed += reclaimed;
        self.collected.fetch_add(reclaimed as u64, Ordering::Relaxed);

        if index < registry.scopes.len() {
            registry.idle_cursor = index;
            return false;
        }

        let done = registry.pass_reclaimed == 0;
        registry.idle_cursor = 0;
        registry.pass_reclaimed = 0;
        done
    }

    /// Drop every entry (isolate disposal).
    pub(crate) fn clear(&self) {
        *self.registry.lock() = Registry::default();
    }

    pub(crate) fn statistics(&self) -> HeapStatistics {
        let registry = self.registry.lock();

        HeapStatistics {
            live_contexts: registry
                .scopes
                .iter()
                .filter(|scope| scope.strong_count() > 0)
                .count(),
            tracked_contexts: registry.scopes.len(),
            collected_contexts: self.collected.load(Ordering::Relaxed),
            full_collections: self.full_collections.load(Ordering::Relaxed),
            memory_limit_hit: self.memory_limit_hit(),
        }
    }
}
