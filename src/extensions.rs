//! Named script modules installed into contexts at construction.
//!
//! Extensions are registered process-wide. A context lists the extensions it
//! wants by name; their dependencies are installed first, and auto-enabled
//! extensions are installed into every new context.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<Extension>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Arc<Extension>>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// A named script module.
#[derive(Debug, Clone)]
pub struct Extension {
    name: String,
    source: String,
    dependencies: Vec<String>,
    auto_enable: bool,
}

impl Extension {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            dependencies: Vec::new(),
            auto_enable: false,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Install into every new context, whether or not it is named.
    pub fn auto_enable(mut self) -> Self {
        self.auto_enable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn is_auto_enabled(&self) -> bool {
        self.auto_enable
    }
}

/// Register an extension. A later registration under the same name replaces it.
pub fn register_extension(extension: Extension) -> Result<()> {
    if extension.name.is_empty() {
        return Err(Error::Initialization(
            "extension name must not be empty".to_string(),
        ));
    }

    let name = extension.name.clone();
    let previous = registry().write().insert(name.clone(), Arc::new(extension));

    if previous.is_some() {
        log::warn!("Extension '{}' registered twice, replacing", name);
    } else {
        log::debug!("Registered extension '{}'", name);
    }

    Ok(())
}

pub fn is_registered(name: &str) -> bool {
    registry().read().contains_key(name)
}

/// Resolve the extensions to install for `names`, in installation order.
pub(crate) fn resolve(names: &[&str]) -> Result<Vec<Arc<Extension>>> {
    let registry = registry().read();

    let mut roots: Vec<&Arc<Extension>> = registry.values().filter(|e| e.auto_enable).collect();
    roots.sort_by(|a, b| a.name.cmp(&b.name));

    for name in names {
        if name.is_empty() {
            return Err(Error::Initialization(
                "extension name must not be empty".to_string(),
            ));
        }

        match registry.get(*name) {
            Some(extension) => roots.push(extension),
            None => log::debug!("Skipping unknown extension '{}'", name),
        }
    }

    let mut resolver = Resolver {
        registry: &registry,
        installed: HashSet::new(),
        visiting: Vec::new(),
        order: Vec::new(),
    };

    for extension in roots {
        resolver.visit(extension)?;
    }

    Ok(resolver.order)
}

struct Resolver<'a> {
    registry: &'a HashMap<String, Arc<Extension>>,
    installed: HashSet<String>,
    visiting: Vec<String>,
    order: Vec<Arc<Extension>>,
}

impl Resolver<'_> {
    fn visit(&mut self, extension: &Arc<Extension>) -> Result<()> {
        if self.installed.contains(&extension.name) {
            return Ok(());
        }

        if self.visiting.contains(&extension.name) {
            return Err(Error::Initialization(format!(
                "extension dependency cycle: {} -> {}",
                self.visiting.join(" -> "),
                extension.name
            )));
        }

        self.visiting.push(extension.name.clone());

        for dependency in &extension.dependencies {
            let Some(resolved) = self.registry.get(dependency) else {
                return Err(Error::Initialization(format!(
                    "extension '{}' depends on unregistered extension '{}'",
                    extension.name, dependency
                )));
            };
            self.visit(resolved)?;
        }

        self.visiting.pop();
        self.installed.insert(extension.name.clone());
        self.order.push(Arc::clone(extension));

        Ok(())
    }
}
