//! Compile and run script source inside a context.
//!
//! Compilation goes through the isolate's engine. Running a compiled script
//! makes its context the top of the thread's scope stack for the duration of
//! the call, enters the isolate if it is not the thread's active one, and
//! materialises the context's global object into an engine scope whose
//! changes are merged back afterwards (also when the script fails part-way).

use rhai::{AST, Dynamic, EvalAltResult, ParseError, Position};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::context::Context;
use crate::error::{Error, Result, ScriptError};
use crate::isolate::IsolateInner;
use crate::marshal;
use crate::security::TimeoutGuard;
use crate::thread_stack::{self, ActiveIsolateGuard, FrameGuard};

/// Name and position of a script in its original source.
///
/// Negative line/column mean "no offset".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOrigin {
    pub name: String,
    pub line: i32,
    pub column: i32,
}

impl Default for ScriptOrigin {
    fn default() -> Self {
        Self {
            name: String::new(),
            line: -1,
            column: -1,
        }
    }
}

impl ScriptOrigin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_position(name: impl Into<String>, line: i32, column: i32) -> Self {
        Self {
            name: name.into(),
            line,
            column,
        }
    }

    fn line_offset(&self) -> usize {
        self.line.max(0) as usize
    }

    fn column_offset(&self) -> usize {
        self.column.max(0) as usize
    }

    /// Map an engine position onto the original source.
    fn locate(&self, pos: Position) -> (Option<usize>, Option<usize>) {
        let line = pos.line();
        let column = pos.position().map(|column| {
            if line == Some(1) {
                column + self.column_offset()
            } else {
                column
            }
        });

        (line.map(|line| line + self.line_offset()), column)
    }

    fn script_error(&self, message: String, pos: Position) -> ScriptError {
        let (line, column) = self.locate(pos);
        ScriptError {
            message,
            script_name: self.name.clone(),
            line,
            column,
        }
    }
}

/// Parsed script that can be passed back to `Context::eval_with` to skip parsing.
///
/// The cache is keyed by a hash of the source; a cache built from different
/// source is ignored and the source is compiled normally.
#[derive(Clone)]
pub struct PrecompiledScript {
    hash: u64,
    ast: AST,
}

impl PrecompiledScript {
    /// Whether this cache was produced from `source`.
    pub fn matches(&self, source: &str) -> bool {
        self.hash == source_hash(source)
    }
}

impl std::fmt::Debug for PrecompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecompiledScript")
            .field("hash", &format_args!("{:016x}", self.hash))
            .finish()
    }
}

fn source_hash(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

/// A compiled script bound to the isolate it was compiled in.
pub struct CompiledScript {
    isolate_id: u64,
    ast: AST,
    origin: ScriptOrigin,
}

impl CompiledScript {
    pub fn origin(&self) -> &ScriptOrigin {
        &self.origin
    }

    /// Run the script in `context` and return its completion value.
    pub fn run(&self, context: &Context) -> Result<Value> {
        let value = self.run_raw(context)?;
        marshal::to_host(&value)
    }

    pub(crate) fn run_raw(&self, context: &Context) -> Result<Dynamic> {
        let scope = context.scope();
        let isolate = &scope.isolate;

        if isolate.id != self.isolate_id {
            return Err(Error::InvalidState(format!(
                "script compiled in isolate {} cannot run in isolate {}",
                self.isolate_id, isolate.id
            )));
        }

        isolate.check_alive()?;

        let _active = ActiveIsolateGuard::enter(isolate);
        let _frame = FrameGuard::push(scope, self.origin.clone());
        let outermost = thread_stack::frame_depth(isolate.id) == 1;

        let timeout_ms = isolate.limits.lock().max_wall_clock_time_ms;
        let timeout = (timeout_ms > 0).then(|| TimeoutGuard::new(isolate.handle(), timeout_ms));

        let mut run = scope.materialize();
        let ast = run.library.merge(&self.ast);

        let result = isolate
            .with_engine(|engine| engine.eval_ast_with_scope::<Dynamic>(&mut run.globals, &ast))?;

        scope.write_back(&run, &self.ast);

        let timed_out = timeout.map(TimeoutGuard::finish).unwrap_or(false);

        match result {
            Ok(value) => {
                if outermost && timed_out {
                    // Watchdog fired after the script completed
                    isolate.terminating.store(false, Ordering::SeqCst);
                }
                Ok(value)
            }
            Err(err) => {
                let error = self.translate(err, context, isolate);

                if outermost && matches!(error, Error::Terminated) {
                    isolate.terminating.store(false, Ordering::SeqCst);
                    tracing::debug!(
                        "Termination of isolate {} delivered (timeout: {})",
                        isolate.id,
                        timed_out
                    );
                }

                Err(error)
            }
        }
    }

    fn translate(
        &self,
        err: Box<EvalAltResult>,
        context: &Context,
        isolate: &Arc<IsolateInner>,
    ) -> Error {
        let mut inner: &EvalAltResult = &err;

        while let EvalAltResult::ErrorInFunctionCall(_, _, nested, _) = inner {
            inner = nested.as_ref();
        }

        match inner {
            EvalAltResult::ErrorTerminated(..) => Error::Terminated,
            EvalAltResult::ErrorDataTooLarge(..) => {
                tracing::warn!(
                    "Out of memory in context {} (isolate {}): {}",
                    context.id(),
                    isolate.id,
                    inner
                );
                context.scope().flag_out_of_memory();
                isolate.heap.flag_memory_limit();
                Error::Runtime(self.origin.script_error(message_of(inner), inner.position()))
            }
            EvalAltResult::ErrorParsing(kind, pos) => {
                Error::Compile(self.origin.script_error(kind.to_string(), *pos))
            }
            EvalAltResult::ErrorRuntime(value, pos) => {
                Error::Runtime(self.origin.script_error(value.to_string(), *pos))
            }
            other => Error::Runtime(self.origin.script_error(message_of(other), other.position())),
        }
    }
}

/// Error message without the trailing position the engine appends.
fn message_of(err: &EvalAltResult) -> String {
    let message = err.to_string();
    let suffix = format!(" ({})", err.position());

    match message.strip_suffix(&suffix) {
        Some(stripped) => stripped.to_string(),
        None => message,
    }
}

fn parse_error(err: &ParseError, origin: &ScriptOrigin) -> Error {
    Error::Compile(origin.script_error(err.err_type().to_string(), err.position()))
}

/// Compile `source` in `isolate`.
pub(crate) fn compile(
    isolate: &Arc<IsolateInner>,
    source: &str,
    origin: ScriptOrigin,
    precompiled: Option<&PrecompiledScript>,
) -> Result<CompiledScript> {
    isolate.check_alive()?;

    let max_executable_size = isolate.limits.lock().max_executable_size;

    if max_executable_size > 0 && source.len() > max_executable_size {
        isolate.heap.flag_memory_limit();
        return Err(Error::Compile(ScriptError {
            message: format!(
                "script of {} bytes exceeds executable size limit of {} bytes",
                source.len(),
                max_executable_size
            ),
            script_name: origin.name.clone(),
            line: None,
            column: None,
        }));
    }

    isolate.heap.mark_used();

    let cached = match precompiled {
        Some(cache) if cache.matches(source) => Some(cache.ast.clone()),
        Some(_) => {
            tracing::debug!(
                "Precompiled data rejected for script '{}' (source mismatch)",
                origin.name
            );
            None
        }
        None => None,
    };

    let mut ast = match cached {
        Some(ast) => ast,
        None => isolate
            .with_engine(|engine| engine.compile(source))?
            .map_err(|e| parse_error(&e, &origin))?,
    };

    if !origin.name.is_empty() {
        ast.set_source(origin.name.as_str());
    }

    Ok(CompiledScript {
        isolate_id: isolate.id,
        ast,
        origin,
    })
}

/// Parse `source` once for reuse with `Context::eval_with`.
pub(crate) fn precompile(isolate: &Arc<IsolateInner>, source: &str) -> Result<PrecompiledScript> {
    let compiled = compile(isolate, source, ScriptOrigin::default(), None)?;

    Ok(PrecompiledScript {
        hash: source_hash(source),
        ast: compiled.ast,
    })
}
