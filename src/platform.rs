//! Process-wide default isolate.
//!
//! The default isolate is created lazily on first use and lives for the rest
//! of the process. It backs `Isolate::new(false)` when the thread has no
//! active isolate, and is the isolate `Locker::default()` locks.

use std::sync::{Arc, OnceLock};

use crate::config::IsolateLimits;
use crate::isolate::IsolateInner;

static DEFAULT_ISOLATE: OnceLock<Arc<IsolateInner>> = OnceLock::new();

/// Get the default isolate, creating it if necessary.
///
/// This is safe to call from multiple threads - the isolate is only
/// created once and the same handle is returned to all callers.
pub(crate) fn default_isolate() -> Arc<IsolateInner> {
    Arc::clone(DEFAULT_ISOLATE.get_or_init(|| {
        let isolate = IsolateInner::new(IsolateLimits::default());
        log::info!("Initialized default isolate {}", isolate.id);
        isolate
    }))
}

