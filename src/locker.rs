//! Scoped engine-lock guards.
//!
//! A [`Locker`] takes an isolate's engine-lock for the current thread; an
//! [`Unlocker`] temporarily hands back a lock held by an enclosing `Locker`
//! so other threads can run in the isolate.
//!
//! Lock order: a thread never blocks on an engine-lock while holding the
//! host lock. Both blocking paths (`Locker::enter` when the lock is
//! contended and `Unlocker::leave`) run inside
//! [`HostLock::allow_threads`], which releases the host lock first and takes
//! it back once the engine-lock is held.
//!
//! ```rust,ignore
//! let isolate = Arc::new(Isolate::new(true));
//!
//! let mut locker = Locker::new(&isolate);
//! locker.enter();
//! context.eval("work()")?;
//!
//! let mut unlocker = Unlocker::new(&isolate);
//! unlocker.enter()?;     // other threads may lock the isolate now
//! blocking_io();
//! unlocker.leave();      // exclusive again
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::host_lock::HostLock;
use crate::isolate::{Isolate, IsolateInner};
use crate::platform;

/// Set once any `Locker` has been entered in this process.
static LOCKING_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Holds an isolate's engine-lock while entered.
///
/// Bound to the thread that created it.
pub struct Locker {
    isolate: Arc<IsolateInner>,
    host: Arc<HostLock>,
    entered: bool,
    _not_send: PhantomData<*const ()>,
}

impl Locker {
    pub fn new(isolate: &Isolate) -> Self {
        Self::with_host_lock(isolate, HostLock::global())
    }

    /// Locker coordinating with a specific host lock instead of the global one.
    pub fn with_host_lock(isolate: &Isolate, host: Arc<HostLock>) -> Self {
        Self::bind(Arc::clone(isolate.inner()), host)
    }

    fn bind(isolate: Arc<IsolateInner>, host: Arc<HostLock>) -> Self {
        Self {
            isolate,
            host,
            entered: false,
            _not_send: PhantomData,
        }
    }

    /// Acquire the engine-lock. No-op if this locker is already entered.
    ///
    /// Blocks while another thread holds the lock, with the host lock
    /// released for the duration of the wait.
    pub fn enter(&mut self) {
        if self.entered {
            return;
        }

        let lock = &self.isolate.engine_lock;

        if !lock.try_lock() {
            tracing::trace!("Isolate {} lock contended, waiting", self.isolate.id);
            self.host.allow_threads(|| lock.lock());
        }

        self.entered = true;
        LOCKING_ACTIVE.store(true, Ordering::SeqCst);
        tracing::trace!("Isolate {} locked", self.isolate.id);
    }

    /// Release the engine-lock. No-op if not entered.
    pub fn leave(&mut self) {
        if !self.entered {
            return;
        }

        self.entered = false;

        match self.isolate.engine_lock.unlock() {
            Ok(()) => tracing::trace!("Isolate {} unlocked", self.isolate.id),
            Err(e) => log::error!("Failed to unlock isolate {}: {}", self.isolate.id, e),
        }
    }

    pub fn entered(&self) -> bool {
        self.entered
    }

    /// Whether any thread holds the isolate's engine-lock.
    pub fn is_locked(&self) -> bool {
        self.isolate.engine_lock.is_locked()
    }

    /// Whether locking has been used in this process.
    pub fn is_active() -> bool {
        LOCKING_ACTIVE.load(Ordering::SeqCst)
    }

    pub fn reset_active() {
        LOCKING_ACTIVE.store(false, Ordering::SeqCst);
    }
}

impl Default for Locker {
    /// Locker for the default isolate.
    fn default() -> Self {
        Self::bind(platform::default_isolate(), HostLock::global())
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Releases the engine-lock held by an enclosing `Locker` on this thread.
pub struct Unlocker {
    isolate: Arc<IsolateInner>,
    host: Arc<HostLock>,
    /// Nesting depth released by `enter()`
    released: Option<usize>,
    _not_send: PhantomData<*const ()>,
}

impl Unlocker {
    pub fn new(isolate: &Isolate) -> Self {
        Self::with_host_lock(isolate, HostLock::global())
    }

    pub fn with_host_lock(isolate: &Isolate, host: Arc<HostLock>) -> Self {
        Self::bind(Arc::clone(isolate.inner()), host)
    }

    fn bind(isolate: Arc<IsolateInner>, host: Arc<HostLock>) -> Self {
        Self {
            isolate,
            host,
            released: None,
            _not_send: PhantomData,
        }
    }

    /// Release every nesting level of the lock held by this thread.
    ///
    /// Fails if this thread does not hold the isolate's engine-lock.
    pub fn enter(&mut self) -> Result<()> {
        if self.released.is_some() {
            return Ok(());
        }

        match self.isolate.engine_lock.release_all() {
            Some(depth) => {
                tracing::trace!("Isolate {} unlocked (depth {})", self.isolate.id, depth);
                self.released = Some(depth);
                Ok(())
            }
            None => Err(Error::InvalidState(format!(
                "unlocker entered without holding the lock of isolate {}",
                self.isolate.id
            ))),
        }
    }

    /// Reacquire the released lock. No-op if not entered.
    pub fn leave(&mut self) {
        let Some(depth) = self.released.take() else {
            return;
        };

        let lock = &self.isolate.engine_lock;
        self.host.allow_threads(|| lock.restore(depth));
        tracing::trace!("Isolate {} relocked (depth {})", self.isolate.id, depth);
    }

    pub fn entered(&self) -> bool {
        self.released.is_some()
    }
}

impl Default for Unlocker {
    fn default() -> Self {
        Self::bind(platform::default_isolate(), HostLock::global())
    }
}

impl Drop for Unlocker {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_twice_is_single_acquisition() {
        let isolate = Isolate::new(true);
        let mut locker = Locker::new(&isolate);

        locker.enter();
        locker.enter();
        assert!(locker.entered());

        locker.leave();
        assert!(!locker.entered());
        assert!(!isolate.is_locked());

        // leave without enter
        locker.leave();
    }

    #[test]
    fn test_nested_lockers_are_reentrant() {
        let isolate = Isolate::new(true);
        let mut outer = Locker::new(&isolate);
        outer.enter();

        {
            let mut inner = Locker::new(&isolate);
            inner.enter();
            assert!(isolate.is_locked_by_current_thread());
        }

        assert!(isolate.is_locked_by_current_thread());
        outer.leave();
        assert!(!isolate.is_locked());
    }

    #[test]
    fn test_unlocker_requires_held_lock() {
        let isolate = Isolate::new(true);
        let mut unlocker = Unlocker::new(&isolate);

        assert!(matches!(unlocker.enter(), Err(Error::InvalidState(_))));
        assert!(!unlocker.entered());
    }

    #[test]
    fn test_unlocker_restores_depth() {
        let isolate = Isolate::new(true);
        let mut outer = Locker::new(&isolate);
        let mut inner = Locker::new(&isolate);
        outer.enter();
        inner.enter();

        {
            let mut unlocker = Unlocker::new(&isolate);
            unlocker.enter().unwrap();
            assert!(!isolate.is_locked());
        }

        inner.leave();
        assert!(isolate.is_locked_by_current_thread());
        outer.leave();
        assert!(!isolate.is_locked());
    }
}
