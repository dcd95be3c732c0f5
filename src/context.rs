//! Contexts: global scopes bound to one isolate.
//!
//! A [`Context`] is a shared handle to a scope. Cloning it, or building one
//! with [`Context::from_existing`], aliases the same scope: a global set
//! through one handle is visible through every other.
//!
//! The global object has two layers:
//! - the prototype, built once from the host overlay object passed at
//!   construction; its bindings are read-only and inherited
//! - own bindings, created by script (`let`, `const`) or through
//!   [`GlobalObject::set`]; they shadow prototype bindings of the same name
//!
//! Functions declared by a script stay callable from later evaluations in
//! the same context.

use parking_lot::Mutex;
use rhai::{AST, Array, Dynamic, ImmutableString, Map, Scope};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::isolate::{Isolate, IsolateInner};
use crate::marshal::{self, HostObject};
use crate::script::{self, CompiledScript, PrecompiledScript, ScriptOrigin};
use crate::thread_stack::{self, StackEntry};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct Binding {
    value: Dynamic,
    constant: bool,
}

struct GlobalState {
    own: BTreeMap<String, Binding>,
    /// Functions declared by earlier evaluations
    library: AST,
}

/// Engine scope for one run, with the own bindings it started from.
pub(crate) struct RunScope {
    pub(crate) globals: Scope<'static>,
    pub(crate) library: AST,
    base: BTreeMap<String, Binding>,
}

/// Structural equality for plain script values; anything else counts as different.
fn same_value(a: &Dynamic, b: &Dynamic) -> bool {
    if a.type_id() != b.type_id() {
        return false;
    }

    if a.is_unit() {
        return true;
    }
    if let (Ok(x), Ok(y)) = (a.as_bool(), b.as_bool()) {
        return x == y;
    }
    if let (Ok(x), Ok(y)) = (a.as_int(), b.as_int()) {
        return x == y;
    }
    if let (Ok(x), Ok(y)) = (a.as_float(), b.as_float()) {
        return x.to_bits() == y.to_bits();
    }
    if let (Ok(x), Ok(y)) = (a.as_char(), b.as_char()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.read_lock::<ImmutableString>(), b.read_lock::<ImmutableString>()) {
        return *x == *y;
    }
    if let (Some(x), Some(y)) = (a.read_lock::<Array>(), b.read_lock::<Array>()) {
        return x.len() == y.len() && x.iter().zip(y.iter()).all(|(x, y)| same_value(x, y));
    }
    if let (Some(x), Some(y)) = (a.read_lock::<Map>(), b.read_lock::<Map>()) {
        return x.len() == y.len()
            && x.iter()
                .zip(y.iter())
                .all(|((kx, vx), (ky, vy))| kx == ky && same_value(vx, vy));
    }

    false
}

/// Scope state shared by every `Context` aliasing it.
pub(crate) struct ScopeCell {
    pub(crate) id: u64,
    pub(crate) isolate: Arc<IsolateInner>,
    overlay: Option<HostObject>,
    prototype: Vec<(String, Dynamic)>,
    state: Mutex<GlobalState>,
    token: Mutex<Option<SecurityToken>>,
    out_of_memory: AtomicBool,
}

impl ScopeCell {
    fn new(isolate: Arc<IsolateInner>, overlay: Option<HostObject>) -> Result<Self> {
        let prototype = match &overlay {
            Some(object) => object
                .iter()
                .map(|(name, value)| {
                    marshal::to_engine(value)
                        .map(|value| (name.clone(), value))
                        .map_err(|e| {
                            Error::Initialization(format!("global overlay property '{}': {}", name, e))
                        })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            isolate,
            overlay,
            prototype,
            state: Mutex::new(GlobalState {
                own: BTreeMap::new(),
                library: AST::empty(),
            }),
            token: Mutex::new(None),
            out_of_memory: AtomicBool::new(false),
        })
    }

    /// Build the engine scope and function library for one run.
    ///
    /// Prototype bindings come first, as constants, so own bindings shadow them.
    pub(crate) fn materialize(&self) -> RunScope {
        let state = self.state.lock();
        let mut globals = Scope::new();

        for (name, value) in &self.prototype {
            globals.push_constant_dynamic(name.clone(), value.clone());
        }

        for (name, binding) in &state.own {
            if binding.constant {
                globals.push_constant_dynamic(name.clone(), binding.value.clone());
            } else {
                globals.push_dynamic(name.clone(), binding.value.clone());
            }
        }

        RunScope {
            globals,
            library: state.library.clone(),
            base: state.own.clone(),
        }
    }

    /// Store the globals and functions left behind by a run.
    ///
    /// Only bindings the run created or changed are stored. Writes made to
    /// the scope while the run was in progress (nested evaluations, host
    /// calls, other threads) survive unless the run changed the same binding.
    pub(crate) fn write_back(&self, run: &RunScope, ast: &AST) {
        // Later entries shadow earlier ones of the same name
        let left: BTreeMap<String, Binding> = run
            .globals
            .iter()
            .skip(self.prototype.len())
            .map(|(name, constant, value)| (name.to_string(), Binding { value, constant }))
            .collect();

        let mut state = self.state.lock();

        for (name, binding) in left {
            let unchanged = run.base.get(&name).is_some_and(|base| {
                base.constant == binding.constant && same_value(&base.value, &binding.value)
            });

            if !unchanged {
                state.own.insert(name, binding);
            }
        }

        state.library = state.library.merge(&ast.clone_functions_only());
    }

    pub(crate) fn flag_out_of_memory(&self) {
        self.out_of_memory.store(true, Ordering::SeqCst);
    }

    fn get(&self, name: &str) -> Option<Dynamic> {
        if let Some(binding) = self.state.lock().own.get(name) {
            return Some(binding.value.clone());
        }

        self.prototype
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    fn default_token(&self) -> SecurityToken {
        match &self.overlay {
            Some(object) => SecurityToken(TokenKind::Overlay(object.identity())),
            None => SecurityToken(TokenKind::Scope(self.id)),
        }
    }
}

/// Opaque value deciding whether two contexts may access each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecurityToken(TokenKind);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TokenKind {
    /// Default token of contexts built from the same overlay object
    Overlay(usize),
    /// Default token of a context built without an overlay
    Scope(u64),
    Explicit(String),
}

impl SecurityToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(TokenKind::Explicit(value.into()))
    }

    /// Whether this is a context's default token rather than one set explicitly.
    pub fn is_default(&self) -> bool {
        !matches!(self.0, TokenKind::Explicit(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0 {
            TokenKind::Explicit(value) => Some(value),
            _ => None,
        }
    }
}

/// Handle to a global scope in an isolate.
#[derive(Clone)]
pub struct Context {
    scope: Arc<ScopeCell>,
}

impl Context {
    /// Create a context in `isolate`.
    ///
    /// `global` is installed as the prototype of the global object. Named
    /// extensions (and every auto-enabled one) are run in the new context,
    /// dependencies first; unknown names are skipped.
    pub fn new(isolate: &Isolate, global: Option<HostObject>, extensions: &[&str]) -> Result<Self> {
        let inner = Arc::clone(isolate.inner());
        inner.check_alive()?;

        let scope = Arc::new(ScopeCell::new(inner, global)?);
        scope.isolate.heap.register_scope(&scope);

        let context = Self { scope };

        for extension in crate::extensions::resolve(extensions)? {
            let origin = ScriptOrigin::new(format!("extension:{}", extension.name()));

            context
                .compile(extension.source(), origin)
                .and_then(|script| script.run_raw(&context))
                .map_err(|e| {
                    Error::Initialization(format!("extension '{}' failed: {}", extension.name(), e))
                })?;

            log::debug!(
                "Installed extension '{}' in context {}",
                extension.name(),
                context.id()
            );
        }

        Ok(context)
    }

    /// Create a context in the thread's active isolate, or the default isolate.
    pub fn in_current(global: Option<HostObject>, extensions: &[&str]) -> Result<Self> {
        Self::new(&Isolate::new(false), global, extensions)
    }

    /// Another handle to the same scope.
    pub fn from_existing(context: &Context) -> Self {
        context.clone()
    }

    pub(crate) fn from_scope(scope: Arc<ScopeCell>) -> Self {
        Self { scope }
    }

    pub(crate) fn scope(&self) -> &Arc<ScopeCell> {
        &self.scope
    }

    pub fn id(&self) -> u64 {
        self.scope.id
    }

    /// Adopting handle to the isolate this context belongs to.
    pub fn isolate(&self) -> Isolate {
        Isolate::adopt(Arc::clone(&self.scope.isolate))
    }

    /// Push this context on the thread's stack for its isolate.
    pub fn enter(&self) -> Result<()> {
        self.scope.isolate.check_alive()?;
        thread_stack::push_scope(
            self.scope.isolate.id,
            StackEntry::Entered(Arc::clone(&self.scope)),
        );
        Ok(())
    }

    /// Pop this context; it must be the top of the thread's stack.
    pub fn leave(&self) -> Result<()> {
        thread_stack::pop_entered(self.scope.isolate.id, self.scope.id)
    }

    /// False once the owning isolate has been disposed.
    pub fn is_entered(&self) -> bool {
        !self.scope.isolate.is_disposed()
    }

    /// Whether an evaluation in this context hit a memory limit.
    pub fn has_out_of_memory_exception(&self) -> bool {
        self.scope.out_of_memory.load(Ordering::SeqCst)
    }

    pub fn security_token(&self) -> SecurityToken {
        match &*self.scope.token.lock() {
            Some(token) => token.clone(),
            None => self.scope.default_token(),
        }
    }

    /// Set an explicit token, or restore the default with `None`.
    pub fn set_security_token(&self, token: Option<SecurityToken>) {
        *self.scope.token.lock() = token;
    }

    pub fn can_access(&self, other: &Context) -> bool {
        self.security_token() == other.security_token()
    }

    pub fn locals(&self) -> GlobalObject {
        GlobalObject {
            scope: Arc::clone(&self.scope),
        }
    }

    pub fn compile(&self, source: &str, origin: ScriptOrigin) -> Result<CompiledScript> {
        script::compile(&self.scope.isolate, source, origin, None)
    }

    /// Compile and run `source`, returning its completion value.
    pub fn eval(&self, source: &str) -> Result<Value> {
        self.eval_with(source, ScriptOrigin::default(), None)
    }

    pub fn eval_with(
        &self,
        source: &str,
        origin: ScriptOrigin,
        precompiled: Option<&PrecompiledScript>,
    ) -> Result<Value> {
        script::compile(&self.scope.isolate, source, origin, precompiled)?.run(self)
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.scope, &other.scope)
    }
}

impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.scope.id)
            .field("isolate", &self.scope.isolate.id)
            .finish()
    }
}

/// Host view of a context's global object.
pub struct GlobalObject {
    scope: Arc<ScopeCell>,
}

impl GlobalObject {
    /// Own binding, else prototype binding.
    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        self.scope
            .get(name)
            .map(|value| marshal::to_host(&value))
            .transpose()
    }

    /// Create or replace an own binding.
    pub fn set(&self, name: &str, value: &Value) -> Result<()> {
        let value = marshal::to_engine(value)?;
        let mut state = self.scope.state.lock();

        if state.own.get(name).is_some_and(|binding| binding.constant) {
            return Err(Error::InvalidState(format!(
                "global '{}' is a constant",
                name
            )));
        }

        state.own.insert(
            name.to_string(),
            Binding {
                value,
                constant: false,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scope.state.lock().own.contains_key(name)
            || self.scope.prototype.iter().any(|(key, _)| key == name)
    }

    /// Own binding names, then inherited names that are not shadowed.
    pub fn keys(&self) -> Vec<String> {
        let state = self.scope.state.lock();
        let mut keys: Vec<String> = state.own.keys().cloned().collect();

        keys.extend(
            self.scope
                .prototype
                .iter()
                .filter(|(name, _)| !state.own.contains_key(name))
                .map(|(name, _)| name.clone()),
        );
        keys
    }

    pub fn prototype(&self) -> Option<&HostObject> {
        self.scope.overlay.as_ref()
    }
}
