//! Per-thread stacks of entered isolates and of entered contexts.
//!
//! Each thread keeps:
//! - the stack of isolates it has entered (top = the thread's active isolate)
//! - for every isolate, the stack of scopes pushed on this thread, either
//!   entered explicitly through `Context::enter` or pushed as a running
//!   script frame by `Context::eval`
//!
//! Nothing here is shared between threads; the same isolate entered on two
//! threads has two independent stacks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ScopeCell;
use crate::error::{Error, Result};
use crate::isolate::IsolateInner;
use crate::script::ScriptOrigin;

thread_local! {
    /// Isolates entered on this thread, innermost last.
    static ENTERED_ISOLATES: RefCell<Vec<Arc<IsolateInner>>> = const { RefCell::new(Vec::new()) };

    /// Scope stacks keyed by isolate id.
    static SCOPE_STACKS: RefCell<HashMap<u64, Vec<StackEntry>>> = RefCell::new(HashMap::new());
}

#[derive(Clone)]
pub(crate) enum StackEntry {
    /// Context entered through the API.
    Entered(Arc<ScopeCell>),
    /// Script running in a context.
    Frame {
        scope: Arc<ScopeCell>,
        origin: ScriptOrigin,
    },
}

impl StackEntry {
    pub(crate) fn scope(&self) -> &Arc<ScopeCell> {
        match self {
            StackEntry::Entered(scope) => scope,
            StackEntry::Frame { scope, .. } => scope,
        }
    }

    fn is_frame(&self) -> bool {
        matches!(self, StackEntry::Frame { .. })
    }
}

// ============================================================================
// Isolates
// ============================================================================

pub(crate) fn push_isolate(isolate: Arc<IsolateInner>) {
    ENTERED_ISOLATES.with(|stack| stack.borrow_mut().push(isolate));
}

/// Pop the innermost entered isolate, which must be `isolate_id`.
pub(crate) fn pop_isolate(isolate_id: u64) -> Result<()> {
    ENTERED_ISOLATES.with(|stack| {
        let mut stack = stack.borrow_mut();

        match stack.last() {
            Some(top) if top.id == isolate_id => {
                stack.pop();
                Ok(())
            }
            Some(top) => Err(Error::InvalidState(format!(
                "isolate {} left while isolate {} is the innermost entered one",
                isolate_id, top.id
            ))),
            None => Err(Error::InvalidState(format!(
                "isolate {} left without a matching enter",
                isolate_id
            ))),
        }
    })
}

/// The thread's active isolate.
pub(crate) fn top_isolate() -> Option<Arc<IsolateInner>> {
    ENTERED_ISOLATES.with(|stack| stack.borrow().last().cloned())
}

// ============================================================================
// Scopes
// ============================================================================

pub(crate) fn push_scope(isolate_id: u64, entry: StackEntry) {
    SCOPE_STACKS.with(|stacks| {
        stacks
            .borrow_mut()
            .entry(isolate_id)
            .or_default()
            .push(entry)
    });
}

/// Pop the top entry of `isolate_id`'s stack; it must be `scope_id` of the given kind.
fn pop_scope(isolate_id: u64, scope_id: u64, frame: bool) -> Result<()> {
    SCOPE_STACKS.with(|stacks| {
        let mut stacks = stacks.borrow_mut();
        let Some(stack) = stacks.get_mut(&isolate_id) else {
            return Err(Error::InvalidState(format!(
                "context {} left without a matching enter",
                scope_id
            )));
        };

        match stack.last() {
            Some(top) if top.scope().id == scope_id && top.is_frame() == frame => {
                stack.pop();
            }
            Some(top) => {
                return Err(Error::InvalidState(format!(
                    "context {} left while context {} is on top of the stack",
                    scope_id,
                    top.scope().id
                )));
            }
            None => {
                return Err(Error::InvalidState(format!(
                    "context {} left without a matching enter",
                    scope_id
                )));
            }
        }

        if stack.is_empty() {
            stacks.remove(&isolate_id);
        }

        Ok(())
    })
}

pub(crate) fn pop_entered(isolate_id: u64, scope_id: u64) -> Result<()> {
    pop_scope(isolate_id, scope_id, false)
}

/// Top of the stack: the scope code on this thread currently runs in.
pub(crate) fn current_scope(isolate_id: u64) -> Option<Arc<ScopeCell>> {
    with_stack(isolate_id, |stack| stack.last().map(|e| Arc::clone(e.scope())))
}

/// Innermost scope entered through the API.
pub(crate) fn entered_scope(isolate_id: u64) -> Option<Arc<ScopeCell>> {
    with_stack(isolate_id, |stack| {
        stack.iter().rev().find_map(|entry| match entry {
            StackEntry::Entered(scope) => Some(Arc::clone(scope)),
            StackEntry::Frame { .. } => None,
        })
    })
}

/// Scope of the innermost running script frame.
pub(crate) fn calling_scope(isolate_id: u64) -> Option<Arc<ScopeCell>> {
    with_stack(isolate_id, |stack| {
        stack.iter().rev().find_map(|entry| match entry {
            StackEntry::Frame { scope, .. } => Some(Arc::clone(scope)),
            StackEntry::Entered(_) => None,
        })
    })
}

pub(crate) fn scope_depth(isolate_id: u64) -> usize {
    with_stack(isolate_id, |stack| stack.len())
}

pub(crate) fn frame_depth(isolate_id: u64) -> usize {
    with_stack(isolate_id, |stack| stack.iter().filter(|e| e.is_frame()).count())
}

/// Running frames, innermost first.
pub(crate) fn frames(isolate_id: u64) -> Vec<(Arc<ScopeCell>, ScriptOrigin)> {
    with_stack(isolate_id, |stack| {
        stack
            .iter()
            .rev()
            .filter_map(|entry| match entry {
                StackEntry::Frame { scope, origin } => Some((Arc::clone(scope), origin.clone())),
                StackEntry::Entered(_) => None,
            })
            .collect()
    })
}

fn with_stack<R>(isolate_id: u64, f: impl FnOnce(&[StackEntry]) -> R) -> R {
    SCOPE_STACKS.with(|stacks| {
        let stacks = stacks.borrow();
        let stack = stacks.get(&isolate_id).map(Vec::as_slice).unwrap_or(&[]);
        f(stack)
    })
}

// ============================================================================
// Guards
// ============================================================================

/// RAII guard keeping a script frame on the stack while it runs.
pub(crate) struct FrameGuard {
    isolate_id: u64,
    scope_id: u64,
}

impl FrameGuard {
    pub(crate) fn push(scope: &Arc<ScopeCell>, origin: ScriptOrigin) -> Self {
        let isolate_id = scope.isolate.id;
        let scope_id = scope.id;

        push_scope(
            isolate_id,
            StackEntry::Frame {
                scope: Arc::clone(scope),
                origin,
            },
        );

        Self {
            isolate_id,
            scope_id,
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Err(e) = pop_scope(self.isolate_id, self.scope_id, true) {
            log::error!("Script frame unwound out of order: {}", e);
        }
    }
}

/// RAII guard making an isolate the thread's active one unless it already is.
pub(crate) struct ActiveIsolateGuard {
    entered: Option<u64>,
}

impl ActiveIsolateGuard {
    pub(crate) fn enter(isolate: &Arc<IsolateInner>) -> Self {
        let already_active = top_isolate().is_some_and(|top| top.id == isolate.id);

        if already_active {
            return Self { entered: None };
        }

        push_isolate(Arc::clone(isolate));
        Self {
            entered: Some(isolate.id),
        }
    }
}

impl Drop for ActiveIsolateGuard {
    fn drop(&mut self) {
        if let Some(id) = self.entered {
            if let Err(e) = pop_isolate(id) {
                log::error!("Isolate scope unwound out of order: {}", e);
            }
        }
    }
}
