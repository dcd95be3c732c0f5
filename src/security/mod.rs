//! Security utilities for isolates shared between threads.
//!
//! ## Components
//!
//! - [`timeout_guard`]: Wall-clock timeout enforcement via watchdog thread
//!
//! ## Usage
//!
//! ```rust,ignore
//! use openworkers_isolate_host::security::TimeoutGuard;
//!
//! let _timeout = TimeoutGuard::new(isolate.thread_safe_handle(), 30_000); // 30s
//! ```
//!
//! `Context::eval` installs the guard automatically when the isolate's
//! limits carry `max_wall_clock_time_ms`.

mod timeout_guard;

pub use timeout_guard::TimeoutGuard;
