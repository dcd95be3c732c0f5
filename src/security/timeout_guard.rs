//! Wall-clock timeout enforcement via watchdog thread.
//!
//! This guard spawns a watchdog thread that monitors execution time and
//! terminates the isolate if the timeout is exceeded.
//!
//! ## How it works
//!
//! 1. Guard spawns a watchdog thread with a timeout duration
//! 2. Thread sleeps until timeout or cancellation
//! 3. On timeout: calls `IsolateHandle::terminate_execution()`
//! 4. On drop (or `finish`): sends cancellation signal, joins thread
//!
//! ## Thread safety
//!
//! The `IsolateHandle` is thread-safe and can be used from the watchdog thread
//! to terminate execution running on another thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::isolate::IsolateHandle;

/// RAII guard that spawns a watchdog thread to terminate execution on timeout.
///
/// # Example
///
/// ```rust,ignore
/// let guard = TimeoutGuard::new(isolate.thread_safe_handle(), 30_000); // 30s timeout
/// let result = context.eval(source);
///
/// if guard.finish() {
///     // terminated by the watchdog
/// }
/// ```
pub struct TimeoutGuard {
    /// Channel to send cancellation signal to watchdog
    cancel_tx: Option<mpsc::Sender<()>>,
    /// Handle to join the watchdog thread
    thread_handle: Option<thread::JoinHandle<()>>,
    /// Flag set when timeout is triggered
    triggered: Arc<AtomicBool>,
}

impl TimeoutGuard {
    /// Create a new timeout guard for the given isolate handle.
    ///
    /// A `timeout_ms` of 0 creates a disabled guard (no watchdog thread).
    pub fn new(isolate_handle: IsolateHandle, timeout_ms: u64) -> Self {
        let triggered = Arc::new(AtomicBool::new(false));

        if timeout_ms == 0 {
            return Self {
                cancel_tx: None,
                thread_handle: None,
                triggered,
            };
        }

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let triggered_clone = triggered.clone();

        let spawned = thread::Builder::new()
            .name("timeout-watchdog".into())
            .spawn(move || {
                let timeout = Duration::from_millis(timeout_ms);

                match cancel_rx.recv_timeout(timeout) {
                    // Cancelled before timeout - normal completion
                    Ok(()) => {}
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        log::warn!(
                            "Wall-clock timeout after {}ms, terminating isolate {}",
                            timeout_ms,
                            isolate_handle.id()
                        );
                        triggered_clone.store(true, Ordering::SeqCst);
                        isolate_handle.terminate_execution();
                    }
                    // Guard dropped without explicit cancel
                    Err(mpsc::RecvTimeoutError::Disconnected) => {}
                }
            });

        match spawned {
            Ok(thread_handle) => Self {
                cancel_tx: Some(cancel_tx),
                thread_handle: Some(thread_handle),
                triggered,
            },
            Err(e) => {
                log::error!("Failed to spawn timeout watchdog thread: {}", e);
                Self {
                    cancel_tx: None,
                    thread_handle: None,
                    triggered,
                }
            }
        }
    }

    /// Check if the timeout was triggered.
    pub fn was_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Cancel the watchdog, wait for it, and report whether it fired.
    pub fn finish(mut self) -> bool {
        self.cancel();
        self.was_triggered()
    }

    fn cancel(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            // Ignore error if thread already exited
            let _ = cancel_tx.send(());
        }

        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                log::error!("Timeout watchdog thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Isolate;

    #[test]
    fn test_disabled_guard() {
        let isolate = Isolate::new(true);
        let guard = TimeoutGuard::new(isolate.thread_safe_handle(), 0);

        assert!(guard.cancel_tx.is_none());
        assert!(guard.thread_handle.is_none());
        assert!(!guard.finish());
    }

    #[test]
    fn test_cancelled_before_timeout() {
        let isolate = Isolate::new(true);
        let guard = TimeoutGuard::new(isolate.thread_safe_handle(), 60_000);

        assert!(!guard.finish());
        assert!(!isolate.is_execution_terminating());
    }

    #[test]
    fn test_timeout_requests_termination() {
        let isolate = Isolate::new(true);
        let guard = TimeoutGuard::new(isolate.thread_safe_handle(), 10);

        thread::sleep(Duration::from_millis(200));

        assert!(guard.finish());
        assert!(isolate.is_execution_terminating());
    }
}
