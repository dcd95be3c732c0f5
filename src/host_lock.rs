//! The host runtime's global execution lock.
//!
//! The host lock is independent of any isolate's engine-lock. Code that may
//! block on an engine-lock while holding the host lock must release the host
//! lock first and take it back afterwards, otherwise a thread holding the
//! engine-lock and waiting for the host lock deadlocks against it.
//! [`HostLock::allow_threads`] is that bracket.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use crate::thread_lock::ThreadLock;

static GLOBAL_HOST_LOCK: OnceLock<Arc<HostLock>> = OnceLock::new();

/// Reentrant process-level execution lock owned by one thread at a time.
#[derive(Debug, Default)]
pub struct HostLock {
    lock: ThreadLock,
}

impl HostLock {
    pub fn new() -> Self {
        Self {
            lock: ThreadLock::new(),
        }
    }

    /// The process-wide host lock used by lockers that are not given one explicitly.
    pub fn global() -> Arc<HostLock> {
        Arc::clone(GLOBAL_HOST_LOCK.get_or_init(|| Arc::new(HostLock::new())))
    }

    /// Acquire the host lock for the current thread (blocking, reentrant).
    pub fn acquire(&self) -> HostLockGuard<'_> {
        self.lock.lock();
        HostLockGuard {
            host: self,
            _not_send: PhantomData,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.lock.is_held_by_current_thread()
    }

    /// Run `f` with the host lock released, if the calling thread holds it.
    ///
    /// The lock is taken back (with its original nesting depth) once `f`
    /// returns, even if it unwinds.
    pub fn allow_threads<R>(&self, f: impl FnOnce() -> R) -> R {
        let _released = match self.lock.release_all() {
            Some(depth) => {
                tracing::trace!("Host lock released (depth {})", depth);
                Some(Reacquire {
                    lock: &self.lock,
                    depth,
                })
            }
            None => None,
        };

        f()
    }
}

/// Restores a released host lock on drop.
struct Reacquire<'a> {
    lock: &'a ThreadLock,
    depth: usize,
}

impl Drop for Reacquire<'_> {
    fn drop(&mut self) {
        self.lock.restore(self.depth);
        tracing::trace!("Host lock reacquired (depth {})", self.depth);
    }
}

/// RAII guard for one acquisition of a [`HostLock`].
pub struct HostLockGuard<'a> {
    host: &'a HostLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for HostLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.host.lock.unlock() {
            log::error!("Failed to release host lock: {}", e);
        }
    }
}
