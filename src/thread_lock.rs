//! Owner-tracking, reentrant mutual exclusion used for both the engine-lock
//! and the host lock.
//!
//! Unlike a `MutexGuard`, ownership is recorded by thread id so a lock can be
//! released and restored across explicit `enter()`/`leave()` calls made by
//! guard objects living in different stack frames.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ThreadLock {
    state: Mutex<Owner>,
    released: Condvar,
}

impl ThreadLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, blocking while another thread owns it.
    ///
    /// Reentrant: the owning thread only increments the nesting depth.
    pub(crate) fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.thread == Some(me) {
            state.depth += 1;
            return;
        }

        while state.thread.is_some() {
            self.released.wait(&mut state);
        }

        state.thread = Some(me);
        state.depth = 1;
    }

    /// Acquire without blocking. Returns false if another thread owns the lock.
    pub(crate) fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        match state.thread {
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
            None => {
                state.thread = Some(me);
                state.depth = 1;
                true
            }
        }
    }

    /// Release one nesting level. Fails if the calling thread is not the owner.
    pub(crate) fn unlock(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.thread != Some(me) {
            return Err(Error::invalid_state(
                "lock released by a thread that does not hold it",
            ));
        }

        state.depth -= 1;

        if state.depth == 0 {
            state.thread = None;
            drop(state);
            self.released.notify_one();
        }

        Ok(())
    }

    /// Release every nesting level held by the calling thread.
    ///
    /// Returns the depth that was held, or `None` if this thread is not the owner.
    pub(crate) fn release_all(&self) -> Option<usize> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.thread != Some(me) {
            return None;
        }

        let depth = std::mem::take(&mut state.depth);
        state.thread = None;
        drop(state);
        self.released.notify_one();

        Some(depth)
    }

    /// Block until the lock is free, then take it with the given depth.
    pub(crate) fn restore(&self, depth: usize) {
        let me = thread::current().id();
        let mut state = self.state.lock();

        while state.thread.is_some() && state.thread != Some(me) {
            self.released.wait(&mut state);
        }

        if state.thread == Some(me) {
            state.depth += depth;
        } else {
            state.thread = Some(me);
            state.depth = depth;
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.lock().thread.is_some()
    }

    pub(crate) fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().thread == Some(thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_reentrant_lock() {
        let lock = ThreadLock::new();

        lock.lock();
        lock.lock();
        assert!(lock.is_held_by_current_thread());

        lock.unlock().unwrap();
        assert!(lock.is_locked());

        lock.unlock().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_unlock_without_lock_fails() {
        let lock = ThreadLock::new();
        assert!(matches!(lock.unlock(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_release_all_and_restore() {
        let lock = ThreadLock::new();
        lock.lock();
        lock.lock();

        assert_eq!(lock.release_all(), Some(2));
        assert!(!lock.is_locked());
        assert_eq!(lock.release_all(), None);

        lock.restore(2);
        lock.unlock().unwrap();
        assert!(lock.is_locked());
        lock.unlock().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_other_thread_blocks_until_unlock() {
        let lock = Arc::new(ThreadLock::new());
        lock.lock();

        let (tx, rx) = mpsc::channel();
        let handle = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                assert!(!lock.try_lock());
                lock.lock();
                tx.send(()).unwrap();
                lock.unlock().unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        lock.unlock().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }
}
