//! Isolates: independent script environments with their own engine and heap.
//!
//! An [`Isolate`] either owns its environment (created with `owner = true`,
//! disposed exactly once by its owner) or adopts an existing one (the
//! thread's active isolate or the process default isolate, never disposed by
//! the adopter).
//!
//! Entering an isolate makes it the thread's active isolate; leaving restores
//! the previously active one. Entry is tracked per thread, so the same
//! isolate may be entered on several threads at once. Serialising those
//! threads is opt-in through [`Locker`](crate::Locker).

use parking_lot::{Mutex, RwLock};
use rhai::{Dynamic, Engine, EvalAltResult, INT};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::config::{CALL_FRAME_BYTES, DEFAULT_MAX_CALL_LEVELS, IsolateLimits};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::heap::{Heap, HeapStatistics};
use crate::locker::Locker;
use crate::platform;
use crate::script::{self, PrecompiledScript};
use crate::stack_limit;
use crate::stack_trace::{self, StackTrace, StackTraceOptions};
use crate::thread_lock::ThreadLock;
use crate::thread_stack;

static NEXT_ISOLATE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state of one isolate, referenced by every `Isolate`, `Context`
/// and `IsolateHandle` bound to it.
pub(crate) struct IsolateInner {
    pub(crate) id: u64,
    /// `None` once disposed
    engine: RwLock<Option<Engine>>,
    pub(crate) limits: Mutex<IsolateLimits>,
    pub(crate) heap: Arc<Heap>,
    /// Polled by the engine's progress callback
    pub(crate) terminating: Arc<AtomicBool>,
    pub(crate) engine_lock: ThreadLock,
    disposed: AtomicBool,
    stack_limit: AtomicUsize,
}

impl IsolateInner {
    pub(crate) fn new(limits: IsolateLimits) -> Arc<Self> {
        let id = NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed);
        let heap = Arc::new(Heap::new());
        let terminating = Arc::new(AtomicBool::new(false));
        let engine = build_engine(&limits, &heap, &terminating);

        log::debug!("Created isolate {}", id);

        Arc::new(Self {
            id,
            engine: RwLock::new(Some(engine)),
            limits: Mutex::new(limits),
            heap,
            terminating,
            engine_lock: ThreadLock::new(),
            disposed: AtomicBool::new(false),
            stack_limit: AtomicUsize::new(0),
        })
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::InvalidState(format!(
                "isolate {} has been disposed",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn handle(self: &Arc<Self>) -> IsolateHandle {
        IsolateHandle {
            id: self.id,
            terminating: Arc::clone(&self.terminating),
            inner: Arc::downgrade(self),
        }
    }

    /// Run `f` with shared access to the engine.
    ///
    /// Recursive read access lets a host function called from a running
    /// script evaluate more script on the same thread.
    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&Engine) -> R) -> Result<R> {
        let engine = self.engine.read_recursive();

        match engine.as_ref() {
            Some(engine) => Ok(f(engine)),
            None => Err(Error::InvalidState(format!(
                "isolate {} has been disposed",
                self.id
            ))),
        }
    }

    /// Run `f` with exclusive access to the engine.
    ///
    /// Fails instead of waiting while script runs in the isolate on any
    /// thread. A run can sit in an `Unlocker` window waiting for the
    /// engine-lock held by the caller, so waiting here could never finish.
    fn with_engine_mut<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> Result<R> {
        if thread_stack::frame_depth(self.id) > 0 {
            return Err(Error::InvalidState(format!(
                "isolate {} cannot be reconfigured while script runs on this thread",
                self.id
            )));
        }

        let Some(mut engine) = self.engine.try_write() else {
            return Err(Error::InvalidState(format!(
                "isolate {} cannot be reconfigured while script runs on another thread",
                self.id
            )));
        };

        match engine.as_mut() {
            Some(engine) => Ok(f(engine)),
            None => Err(Error::InvalidState(format!(
                "isolate {} has been disposed",
                self.id
            ))),
        }
    }

    fn apply_limits(&self) -> Result<()> {
        let limits = self.limits.lock().clone();
        self.with_engine_mut(|engine| limits.apply(engine))
    }

    fn dispose(&self) -> Result<()> {
        self.check_alive()?;

        if thread_stack::frame_depth(self.id) > 0 {
            return Err(Error::InvalidState(format!(
                "isolate {} disposed while script runs on this thread",
                self.id
            )));
        }

        let Some(mut engine) = self.engine.try_write() else {
            return Err(Error::InvalidState(format!(
                "isolate {} disposed while script runs on another thread",
                self.id
            )));
        };

        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState(format!(
                "isolate {} disposed twice",
                self.id
            )));
        }

        *engine = None;
        drop(engine);

        self.heap.clear();
        log::debug!("Disposed isolate {}", self.id);

        Ok(())
    }
}

fn build_engine(limits: &IsolateLimits, heap: &Arc<Heap>, terminating: &Arc<AtomicBool>) -> Engine {
    let mut engine = Engine::new();
    limits.apply(&mut engine);

    let flag = Arc::clone(terminating);
    engine.on_progress(move |_| {
        if flag.load(Ordering::Relaxed) {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    engine.on_print(|text| log::info!(target: "script", "{}", text));
    engine.on_debug(|text, source, pos| {
        log::debug!(target: "script", "{} ({}:{})", text, source.unwrap_or("<anonymous>"), pos)
    });

    // Script-visible collection trigger, available once exposed by a forced collection
    let heap = Arc::clone(heap);
    engine.register_fn("gc", move || -> std::result::Result<INT, Box<EvalAltResult>> {
        if !heap.is_gc_exposed() {
            return Err("gc is not defined".into());
        }
        Ok(heap.full_collection() as INT)
    });

    engine
}

/// Handle to an isolate, owning or adopted.
///
/// `Isolate` is `Send + Sync`; share one between threads with `Arc<Isolate>`.
pub struct Isolate {
    inner: Arc<IsolateInner>,
    owner: bool,
}

impl Isolate {
    /// Create a new isolate (`owner = true`) or adopt the thread's active
    /// isolate, falling back to the process default isolate (`owner = false`).
    pub fn new(owner: bool) -> Self {
        if owner {
            return Self::with_limits(IsolateLimits::default());
        }

        let inner = thread_stack::top_isolate().unwrap_or_else(platform::default_isolate);
        Self::adopt(inner)
    }

    /// Create an owned isolate with the given limits.
    pub fn with_limits(limits: IsolateLimits) -> Self {
        Self {
            inner: IsolateInner::new(limits),
            owner: true,
        }
    }

    /// Adopting handle to the thread's active isolate.
    pub fn current() -> Option<Self> {
        thread_stack::top_isolate().map(Self::adopt)
    }

    /// Adopting handle to the process default isolate.
    pub fn default_isolate() -> Self {
        Self::adopt(platform::default_isolate())
    }

    pub(crate) fn adopt(inner: Arc<IsolateInner>) -> Self {
        Self {
            inner,
            owner: false,
        }
    }

    pub(crate) fn inner(&self) -> &Arc<IsolateInner> {
        &self.inner
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether this handle must dispose the isolate.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    // ------------------------------------------------------------------------
    // Thread entry
    // ------------------------------------------------------------------------

    /// Make this isolate the thread's active isolate (reentrant).
    pub fn enter(&self) -> Result<()> {
        self.inner.check_alive()?;
        thread_stack::push_isolate(Arc::clone(&self.inner));
        Ok(())
    }

    /// Undo one `enter()`, restoring the previously active isolate.
    pub fn leave(&self) -> Result<()> {
        thread_stack::pop_isolate(self.inner.id)
    }

    // ------------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------------

    /// Request that script running in this isolate stops, from any thread.
    pub fn terminate(&self) {
        self.inner.terminating.store(true, Ordering::SeqCst);
        log::debug!("Termination requested for isolate {}", self.inner.id);
    }

    pub fn is_execution_terminating(&self) -> bool {
        self.inner.terminating.load(Ordering::SeqCst)
    }

    /// Thread-safe handle for terminating execution from other threads.
    pub fn thread_safe_handle(&self) -> IsolateHandle {
        self.inner.handle()
    }

    /// Dispose the isolate. Only the owner may dispose, exactly once.
    pub fn dispose(&self) -> Result<()> {
        if !self.owner {
            return Err(Error::InvalidState(format!(
                "isolate {} is adopted and cannot be disposed by this handle",
                self.inner.id
            )));
        }

        self.inner.dispose()
    }

    // ------------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------------

    /// Set memory limits in bytes; zero leaves a value unchanged.
    ///
    /// Only accepted before the isolate's first allocation.
    pub fn set_memory_limit(&self, young: usize, old: usize, executable: usize) -> bool {
        if self.inner.is_disposed() {
            return false;
        }

        let previous = {
            let mut limits = self.inner.limits.lock();

            if self.inner.heap.is_used() {
                tracing::warn!(
                    "Memory limit for isolate {} rejected: heap already in use",
                    self.inner.id
                );
                return false;
            }

            let previous = limits.clone();
            limits.merge_memory(young, old, executable);
            previous
        };

        match self.inner.apply_limits() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Memory limit for isolate {} rejected: {}", self.inner.id, e);

                let mut limits = self.inner.limits.lock();
                limits.max_young_space_size = previous.max_young_space_size;
                limits.max_old_space_size = previous.max_old_space_size;
                limits.max_executable_size = previous.max_executable_size;
                false
            }
        }
    }

    /// Limit the stack available to script to `size` bytes below the caller's frame.
    ///
    /// `size = 0` restores the default call depth. False when disposed or
    /// while script runs in the isolate.
    pub fn set_stack_limit(&self, size: u32) -> bool {
        if self.inner.is_disposed() {
            return false;
        }

        let (address, levels) = if size == 0 {
            (0, DEFAULT_MAX_CALL_LEVELS)
        } else {
            (
                stack_limit::calc_stack_limit(size),
                (size as usize / CALL_FRAME_BYTES).max(1),
            )
        };

        let previous = std::mem::replace(&mut self.inner.limits.lock().max_call_levels, levels);

        if let Err(e) = self.inner.apply_limits() {
            tracing::warn!("Stack limit for isolate {} rejected: {}", self.inner.id, e);
            self.inner.limits.lock().max_call_levels = previous;
            return false;
        }

        self.inner.stack_limit.store(address, Ordering::SeqCst);
        tracing::debug!(
            "Stack limit for isolate {} set to {:#x} ({} call levels)",
            self.inner.id,
            address,
            levels
        );
        true
    }

    /// Stack-bottom address recorded by the last `set_stack_limit`, 0 if none.
    pub fn stack_limit(&self) -> usize {
        self.inner.stack_limit.load(Ordering::SeqCst)
    }

    pub fn limits(&self) -> IsolateLimits {
        self.inner.limits.lock().clone()
    }

    // ------------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------------

    /// Reclaim unreferenced contexts.
    ///
    /// `force` runs a full collection and exposes `gc()` to script; otherwise
    /// idle notifications are issued until the heap reports no idle work.
    pub fn collect_garbage(&self, force: bool) {
        if self.inner.is_disposed() {
            return;
        }

        let heap = &self.inner.heap;

        if force {
            heap.expose_gc();
            let reclaimed = heap.full_collection();
            log::debug!(
                "Full collection of isolate {} reclaimed {} contexts",
                self.inner.id,
                reclaimed
            );
        } else {
            while !heap.idle_notification() {}
        }
    }

    pub fn heap_statistics(&self) -> HeapStatistics {
        self.inner.heap.statistics()
    }

    // ------------------------------------------------------------------------
    // Context queries (this thread)
    // ------------------------------------------------------------------------
    //
    // Stacks are kept per isolate and per thread, so these answer for this
    // isolate on the calling thread whether or not it is the thread's active
    // isolate. `Isolate::current()` gives the active one.

    /// Innermost context entered through `Context::enter`.
    pub fn entered_context(&self) -> Option<Context> {
        thread_stack::entered_scope(self.inner.id).map(Context::from_scope)
    }

    /// Context on top of this thread's stack.
    pub fn current_context(&self) -> Option<Context> {
        thread_stack::current_scope(self.inner.id).map(Context::from_scope)
    }

    /// Context of the innermost running script.
    pub fn calling_context(&self) -> Option<Context> {
        thread_stack::calling_scope(self.inner.id).map(Context::from_scope)
    }

    pub fn in_context(&self) -> bool {
        thread_stack::scope_depth(self.inner.id) > 0
    }

    // ------------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------------

    /// Whether any thread holds this isolate's engine-lock.
    pub fn is_locked(&self) -> bool {
        self.inner.engine_lock.is_locked()
    }

    pub fn is_locked_by_current_thread(&self) -> bool {
        self.inner.engine_lock.is_held_by_current_thread()
    }

    /// Run `f` while holding this isolate's engine-lock.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut locker = Locker::new(self);
        locker.enter();
        f()
    }

    // ------------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------------

    /// Parse `source` once for reuse with `Context::eval_with`.
    pub fn precompile(&self, source: &str) -> Result<PrecompiledScript> {
        script::precompile(&self.inner, source)
    }

    /// Register host functions or otherwise configure the isolate's engine.
    ///
    /// `InvalidState` while script runs in the isolate on any thread.
    pub fn configure_engine(&self, f: impl FnOnce(&mut Engine)) -> Result<()> {
        self.inner.check_alive()?;
        self.inner.with_engine_mut(f)
    }

    /// Frames of script currently running in this isolate on this thread.
    pub fn current_stack_trace(&self, frame_limit: usize, options: StackTraceOptions) -> StackTrace {
        stack_trace::capture(self, frame_limit, options)
    }
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.inner.id)
            .field("owner", &self.owner)
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        if !self.owner || self.inner.is_disposed() {
            return;
        }

        if let Err(e) = self.inner.dispose() {
            log::error!("Failed to dispose isolate {} on drop: {}", self.inner.id, e);
        }
    }
}

/// Thread-safe handle for terminating an isolate's execution.
///
/// Does not keep the isolate alive.
#[derive(Clone)]
pub struct IsolateHandle {
    id: u64,
    terminating: Arc<AtomicBool>,
    inner: Weak<IsolateInner>,
}

impl IsolateHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request termination. Returns false if the isolate is gone or disposed.
    pub fn terminate_execution(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) if !inner.is_disposed() => {
                self.terminating.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_terminate_execution(&self) {
        self.terminating.store(false, Ordering::SeqCst);
    }

    pub fn is_execution_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for IsolateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adopted_isolate_cannot_dispose() {
        let isolate = Isolate::new(true);
        isolate.enter().unwrap();

        let adopted = Isolate::new(false);
        assert_eq!(adopted.id(), isolate.id());
        assert!(!adopted.is_owner());
        assert!(matches!(adopted.dispose(), Err(Error::InvalidState(_))));

        isolate.leave().unwrap();
    }

    #[test]
    fn test_dispose_twice_fails() {
        let isolate = Isolate::new(true);
        isolate.dispose().unwrap();

        assert!(isolate.is_disposed());
        assert!(matches!(isolate.dispose(), Err(Error::InvalidState(_))));
        assert!(matches!(isolate.enter(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_handle_outlives_isolate() {
        let handle = {
            let isolate = Isolate::new(true);
            isolate.thread_safe_handle()
        };

        assert!(!handle.terminate_execution());
    }

    #[test]
    fn test_rejected_limits_are_rolled_back() {
        let isolate = Isolate::new(true);
        assert!(isolate.set_memory_limit(1024, 0, 0));

        // A run in progress elsewhere holds the engine
        let running = isolate.inner.engine.read();

        assert!(!isolate.set_memory_limit(2048, 4096, 64));
        assert!(!isolate.set_stack_limit(64 * 1024));
        assert!(matches!(
            isolate.configure_engine(|_| {}),
            Err(Error::InvalidState(_))
        ));

        drop(running);

        let limits = isolate.limits();
        assert_eq!(limits.max_young_space_size, 1024);
        assert_eq!(limits.max_old_space_size, 0);
        assert_eq!(limits.max_executable_size, 0);
        assert_eq!(limits.max_call_levels, DEFAULT_MAX_CALL_LEVELS);
        assert_eq!(isolate.stack_limit(), 0);

        assert!(isolate.set_memory_limit(2048, 0, 0));
        assert_eq!(isolate.limits().max_young_space_size, 2048);
    }

    #[test]
    fn test_stack_limit_zero_restores_default_depth() {
        let isolate = Isolate::new(true);

        assert!(isolate.set_stack_limit(64 * 1024));
        assert_ne!(isolate.stack_limit(), 0);
        assert_eq!(isolate.limits().max_call_levels, 16);

        assert!(isolate.set_stack_limit(0));
        assert_eq!(isolate.stack_limit(), 0);
        assert_eq!(isolate.limits().max_call_levels, DEFAULT_MAX_CALL_LEVELS);
    }
}
