//! Value translation between the host model (`serde_json::Value`) and the
//! engine model (`rhai::Dynamic`).

use rhai::Dynamic;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Convert a host value into an engine value.
pub fn to_engine(value: &Value) -> Result<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| Error::Marshal(e.to_string()))
}

/// Convert an engine value into a host value.
///
/// Unit becomes `null`. Function pointers have no host representation.
pub fn to_host(value: &Dynamic) -> Result<Value> {
    if value.is_unit() {
        return Ok(Value::Null);
    }

    if value.is::<rhai::FnPtr>() {
        return Err(Error::Marshal(
            "function values cannot be passed to the host".to_string(),
        ));
    }

    rhai::serde::from_dynamic::<Value>(value).map_err(|e| Error::Marshal(e.to_string()))
}

/// A host object with identity, used as a context's global overlay.
///
/// Clones share identity: two contexts built from clones of the same
/// `HostObject` get the same default security token.
#[derive(Debug, Clone)]
pub struct HostObject(Arc<Map<String, Value>>);

impl HostObject {
    pub fn new(properties: Map<String, Value>) -> Self {
        Self(Arc::new(properties))
    }

    /// Build from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::new(map)),
            other => Err(Error::Initialization(format!(
                "global overlay must be an object, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for HostObject {}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
