//! Stack traces of script running on the current thread.

use crate::isolate::Isolate;
use crate::thread_stack;

/// Which details to include in captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackTraceOptions {
    pub script_name: bool,
    pub line_number: bool,
    pub column: bool,
    pub context_id: bool,
}

impl StackTraceOptions {
    pub const OVERVIEW: Self = Self {
        script_name: true,
        line_number: false,
        column: false,
        context_id: false,
    };

    pub const DETAILED: Self = Self {
        script_name: true,
        line_number: true,
        column: true,
        context_id: true,
    };
}

impl Default for StackTraceOptions {
    fn default() -> Self {
        Self::OVERVIEW
    }
}

/// One running script evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub script_name: Option<String>,
    /// Line offset of the script in its original source
    pub line_number: Option<i32>,
    pub column: Option<i32>,
    pub context_id: Option<u64>,
}

/// Frames innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
}

impl StackTrace {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Capture up to `frame_limit` frames running in `isolate` on this thread.
pub fn capture(isolate: &Isolate, frame_limit: usize, options: StackTraceOptions) -> StackTrace {
    let frames = thread_stack::frames(isolate.id())
        .into_iter()
        .take(frame_limit)
        .map(|(scope, origin)| StackFrame {
            script_name: options.script_name.then(|| origin.name.clone()),
            line_number: options.line_number.then_some(origin.line),
            column: options.column.then_some(origin.column),
            context_id: options.context_id.then_some(scope.id),
        })
        .collect();

    StackTrace { frames }
}
