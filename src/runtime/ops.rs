//! Host-function registry backing script-visible globals.
//!
//! Each context owns a [`FunctionRegistry`] mapping dotted global paths to
//! host callables. The engine-side binding only carries the path; the
//! callable is looked up at call time, so re-attaching a path swaps the
//! implementation without touching the script heap.

use crate::runtime::error::BridgeError;
use crate::runtime::js_value::{JSValue, JsErrorValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Error raised by a host function. Becomes a script exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    /// Name of the script-side error, e.g. `Error` or `TypeError`
    pub name: String,
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::named("TypeError", message)
    }

    pub(crate) fn to_error_value(&self) -> JsErrorValue {
        JsErrorValue::new(self.name.clone(), self.message.clone())
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for HostError {}

impl From<BridgeError> for HostError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Runtime {
                value: JSValue::Error(thrown),
            } => HostError::named(thrown.name, thrown.message),
            other => HostError::new(other.to_string()),
        }
    }
}

/// A host callable invoked synchronously from script.
pub trait HostFunction: Send + Sync + 'static {
    fn invoke(&self, args: Vec<JSValue>) -> Result<JSValue, HostError>;
}

impl<F> HostFunction for F
where
    F: Fn(Vec<JSValue>) -> Result<JSValue, HostError> + Send + Sync + 'static,
{
    fn invoke(&self, args: Vec<JSValue>) -> Result<JSValue, HostError> {
        self(args)
    }
}

/// Box a closure as a shareable host function.
pub fn host_fn<F>(function: F) -> Arc<dyn HostFunction>
where
    F: Fn(Vec<JSValue>) -> Result<JSValue, HostError> + Send + Sync + 'static,
{
    Arc::new(function)
}

/// Split a dotted global path, rejecting empty segments.
pub(crate) fn parse_path(path: &str) -> Result<Vec<&str>, BridgeError> {
    let segments: Vec<&str> = path.split('.').collect();
    let valid = segments
        .iter()
        .all(|segment| !segment.is_empty() && !segment.chars().any(char::is_whitespace));
    if !valid {
        return Err(BridgeError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

/// Per-context registry of attached host functions.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<dyn HostFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `path`, returning the callable it replaced.
    pub fn insert(
        &self,
        path: &str,
        function: Arc<dyn HostFunction>,
    ) -> Result<Option<Arc<dyn HostFunction>>, BridgeError> {
        parse_path(path)?;
        Ok(self.functions.write().insert(path.to_string(), function))
    }

    /// Undo an insert, restoring the previous callable if there was one.
    pub(crate) fn restore(&self, path: &str, previous: Option<Arc<dyn HostFunction>>) {
        let mut functions = self.functions.write();
        match previous {
            Some(function) => {
                functions.insert(path.to_string(), function);
            }
            None => {
                functions.remove(path);
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn HostFunction>> {
        self.functions.read().get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.functions.read().contains_key(path)
    }

    /// Sorted list of attached paths.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.functions.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }

    /// Look up and call the function registered at `path`.
    pub fn call(&self, path: &str, args: Vec<JSValue>) -> Result<JSValue, HostError> {
        let function = self
            .get(path)
            .ok_or_else(|| HostError::named("ReferenceError", format!("{} is not attached", path)))?;
        function.invoke(args)
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("paths", &self.paths())
            .finish()
    }
}
