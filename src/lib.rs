pub mod config;
pub mod context;
pub mod error;
pub mod extensions;
pub mod heap;
pub mod host_lock;
pub mod isolate;
pub mod locker;
pub mod marshal;
pub mod script;
pub mod security;
pub mod stack_limit;
pub mod stack_trace;

mod platform;
mod thread_lock;
mod thread_stack;

// Core API
pub use context::{Context, GlobalObject, SecurityToken};
pub use isolate::{Isolate, IsolateHandle};
pub use locker::{Locker, Unlocker};

// Collaborator seams and configuration
pub use config::IsolateLimits;
pub use error::{Error, Result, ScriptError};
pub use extensions::{Extension, register_extension};
pub use heap::HeapStatistics;
pub use host_lock::HostLock;
pub use marshal::HostObject;
pub use script::{CompiledScript, PrecompiledScript, ScriptOrigin};
pub use stack_trace::{StackFrame, StackTrace, StackTraceOptions};
