//! Python bindings exposing isolates, contexts and snapshots.
//!
//! Every call that may block on an isolate releases the GIL first, so a
//! Python host function attached to a context can re-acquire it while the
//! evaluation that called it is still in flight.

use crate::runtime::config::{ContextConfig, EvalOptions, IsolateConfig};
use crate::runtime::context::{Context, EvalOutcome};
use crate::runtime::error::BridgeError;
use crate::runtime::isolate::Isolate;
use crate::runtime::js_value::{JSValue, LimitTracker, MAX_JS_BYTES, MAX_JS_DEPTH, MAX_SAFE_INTEGER};
use crate::runtime::ops::HostError;
use crate::runtime::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use pyo3::create_exception;
use pyo3::exceptions::{
    PyException, PyMemoryError, PyRuntimeError, PySyntaxError, PyTypeError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyBytes, PyDict, PyFloat, PyInt, PyList, PyString, PyTuple};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

create_exception!(_jsbridge, JavaScriptError, PyException);
create_exception!(_jsbridge, ScriptTerminatedError, PyException);

/// Register the Python surface on the extension module.
pub(crate) fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyIsolate>()?;
    m.add_class::<PyContext>()?;
    m.add_class::<PySnapshot>()?;
    m.add_class::<PyUnsupported>()?;
    m.add("JavaScriptError", m.py().get_type::<JavaScriptError>())?;
    m.add(
        "ScriptTerminatedError",
        m.py().get_type::<ScriptTerminatedError>(),
    )?;
    m.add_function(wrap_pyfunction!(set_flags, m)?)?;
    Ok(())
}

fn to_py_err(err: BridgeError) -> PyErr {
    match &err {
        BridgeError::Runtime { value } => javascript_error(err.to_string(), value),
        BridgeError::Compile { message } => PySyntaxError::new_err(message.clone()),
        BridgeError::ScriptTerminated { .. } => ScriptTerminatedError::new_err(err.to_string()),
        BridgeError::Allocation(_) => PyMemoryError::new_err(err.to_string()),
        BridgeError::CyclicValue(_)
        | BridgeError::UnsupportedValue(_)
        | BridgeError::Conversion(_) => PyTypeError::new_err(err.to_string()),
        BridgeError::Configuration(_)
        | BridgeError::SnapshotVersion { .. }
        | BridgeError::NameConflict { .. }
        | BridgeError::InvalidPath(_) => PyValueError::new_err(err.to_string()),
        BridgeError::IsolateClosed | BridgeError::ContextClosed => {
            PyRuntimeError::new_err(err.to_string())
        }
    }
}

/// `JavaScriptError` carrying the thrown value as `.value`, plus `.name`
/// when script threw an error object.
fn javascript_error(message: String, thrown: &JSValue) -> PyErr {
    Python::attach(|py| {
        let err = JavaScriptError::new_err(message);
        let exception = err.value(py);
        let attached = js_value_to_python(py, thrown)
            .and_then(|value| exception.setattr("value", value))
            .and_then(|()| match thrown {
                JSValue::Error(error) => exception.setattr("name", error.name.as_str()),
                _ => Ok(()),
            });
        if let Err(failure) = attached {
            tracing::debug!(error = %failure, "Could not attach thrown value to JavaScriptError");
        }
        err
    })
}

/// Script value with no Python form, e.g. a function or symbol.
#[pyclass(name = "Unsupported", frozen)]
pub struct PyUnsupported {
    #[pyo3(get)]
    kind: String,
}

#[pymethods]
impl PyUnsupported {
    fn __repr__(&self) -> String {
        format!("<unsupported {}>", self.kind)
    }
}

/// Convert a JSValue into a Python object.
pub(crate) fn js_value_to_python(py: Python<'_>, value: &JSValue) -> PyResult<Py<PyAny>> {
    match value {
        JSValue::Null => Ok(py.None()),
        JSValue::Bool(b) => Ok(PyBool::new(py, *b).to_owned().into_any().unbind()),
        JSValue::Int(i) => Ok(PyInt::new(py, *i).into()),
        JSValue::Float(f) => Ok(PyFloat::new(py, *f).into()),
        JSValue::String(s) => Ok(PyString::new(py, s).into()),
        JSValue::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(js_value_to_python(py, item)?)?;
            }
            Ok(list.into())
        }
        JSValue::Object(map) => {
            let dict = PyDict::new(py);
            for (key, val) in map {
                dict.set_item(key, js_value_to_python(py, val)?)?;
            }
            Ok(dict.into())
        }
        JSValue::Date(date) => Ok(date.into_pyobject(py)?.into_any().unbind()),
        JSValue::Error(error) => {
            let err = JavaScriptError::new_err(format!("{}: {}", error.name, error.message));
            Ok(err.into_value(py).into_any())
        }
        JSValue::Unsupported(kind) => Ok(Py::new(py, PyUnsupported { kind: kind.clone() })?.into_any()),
    }
}

/// Convert a Python object into a JSValue.
pub(crate) fn python_to_js_value(obj: Bound<'_, PyAny>) -> PyResult<JSValue> {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut tracker = LimitTracker::new(MAX_JS_DEPTH, MAX_JS_BYTES);
    python_to_js_value_internal(obj, &mut seen, &mut tracker)
}

fn python_to_js_value_internal(
    obj: Bound<'_, PyAny>,
    seen: &mut HashSet<usize>,
    tracker: &mut LimitTracker,
) -> PyResult<JSValue> {
    tracker.enter().map_err(to_py_err)?;

    let add_bytes =
        |bytes: usize, tracker: &mut LimitTracker| tracker.add_bytes(bytes).map_err(to_py_err);

    let result = if obj.is_none() {
        add_bytes(4, tracker)?;
        Ok(JSValue::Null)
    } else if let Ok(b) = obj.cast::<PyBool>() {
        add_bytes(1, tracker)?;
        Ok(JSValue::Bool(b.is_true()))
    } else if obj.is_instance_of::<PyList>() || obj.is_instance_of::<PyTuple>() {
        let ptr = obj.as_ptr() as usize;
        if !seen.insert(ptr) {
            return Err(to_py_err(BridgeError::CyclicValue(
                "Python list refers to itself".to_string(),
            )));
        }

        let len = obj.len()?;
        add_bytes(16, tracker)?;
        add_bytes(len.saturating_mul(std::mem::size_of::<usize>()), tracker)?;

        let mut items = Vec::with_capacity(len);
        for item in obj.try_iter()? {
            items.push(python_to_js_value_internal(item?, seen, tracker)?);
        }
        seen.remove(&ptr);
        Ok(JSValue::Array(items))
    } else if let Ok(dict) = obj.cast::<PyDict>() {
        let ptr = dict.as_ptr() as usize;
        if !seen.insert(ptr) {
            return Err(to_py_err(BridgeError::CyclicValue(
                "Python dict refers to itself".to_string(),
            )));
        }

        add_bytes(24, tracker)?;
        add_bytes(
            dict.len().saturating_mul(std::mem::size_of::<usize>() * 2),
            tracker,
        )?;

        let mut map = IndexMap::with_capacity(dict.len());
        for (key, value) in dict.iter() {
            let key_str = key.str()?.to_string();
            add_bytes(key_str.len() + 8, tracker)?;
            map.insert(key_str, python_to_js_value_internal(value, seen, tracker)?);
        }
        seen.remove(&ptr);
        Ok(JSValue::Object(map))
    } else if obj.is_instance_of::<PyInt>() {
        add_bytes(std::mem::size_of::<i64>(), tracker)?;
        match obj.extract::<i64>() {
            Ok(i) if i.unsigned_abs() <= MAX_SAFE_INTEGER as u64 => Ok(JSValue::Int(i)),
            _ => Ok(JSValue::Float(obj.extract::<f64>()?)),
        }
    } else if let Ok(f) = obj.extract::<f64>() {
        add_bytes(std::mem::size_of::<f64>(), tracker)?;
        Ok(JSValue::Float(f))
    } else if let Ok(s) = obj.extract::<String>() {
        add_bytes(s.len() + 16, tracker)?;
        Ok(JSValue::String(s))
    } else if let Ok(date) = obj.extract::<DateTime<Utc>>() {
        add_bytes(8, tracker)?;
        Ok(JSValue::Date(date))
    } else if let Ok(marker) = obj.cast::<PyUnsupported>() {
        Ok(JSValue::Unsupported(marker.get().kind.clone()))
    } else {
        Err(PyTypeError::new_err(format!(
            "Unsupported Python type for script conversion: {}",
            obj.get_type().name()?
        )))
    };

    tracker.exit();
    result
}

/// Turn a Python exception into a host error named after its class.
fn host_error_from_py(py: Python<'_>, err: PyErr) -> HostError {
    let name = err
        .get_type(py)
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "Error".to_string());
    HostError::named(name, err.value(py).to_string())
}

fn call_python(callable: &Py<PyAny>, args: Vec<JSValue>) -> Result<JSValue, HostError> {
    Python::attach(|py| {
        let converted = args
            .iter()
            .map(|arg| js_value_to_python(py, arg))
            .collect::<PyResult<Vec<_>>>()
            .map_err(|e| host_error_from_py(py, e))?;
        let tuple = PyTuple::new(py, converted).map_err(|e| host_error_from_py(py, e))?;
        let result = callable
            .call1(py, tuple)
            .map_err(|e| host_error_from_py(py, e))?;
        python_to_js_value(result.into_bound(py)).map_err(|e| host_error_from_py(py, e))
    })
}

fn eval_options(timeout_ms: Option<u64>, max_memory: Option<usize>) -> EvalOptions {
    let mut options = EvalOptions::default();
    if let Some(ms) = timeout_ms {
        options = options.with_timeout_ms(ms);
    }
    if let Some(bytes) = max_memory {
        options = options.with_max_memory(bytes);
    }
    options
}

/// Apply engine flags. Must run before any isolate, context or snapshot.
#[pyfunction]
fn set_flags(flags: Vec<String>) -> PyResult<()> {
    crate::runtime::set_flags(flags).map_err(to_py_err)
}

#[pyclass(name = "Snapshot", frozen)]
pub struct PySnapshot {
    inner: Mutex<Snapshot>,
}

#[pymethods]
impl PySnapshot {
    #[staticmethod]
    fn create(py: Python<'_>, source: String) -> PyResult<Self> {
        let snapshot = py.detach(|| Snapshot::create(&source)).map_err(to_py_err)?;
        Ok(Self {
            inner: Mutex::new(snapshot),
        })
    }

    #[staticmethod]
    fn from_bytes(data: &[u8]) -> PyResult<Self> {
        let snapshot = Snapshot::from_bytes(data).map_err(to_py_err)?;
        Ok(Self {
            inner: Mutex::new(snapshot),
        })
    }

    #[staticmethod]
    fn engine_version() -> &'static str {
        Snapshot::engine_version()
    }

    fn warmup(&self, py: Python<'_>, source: String) -> PyResult<()> {
        let mut snapshot = self.inner.lock().clone();
        py.detach(|| snapshot.warmup(&source)).map_err(to_py_err)?;
        *self.inner.lock() = snapshot;
        Ok(())
    }

    fn to_bytes<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, &self.inner.lock().to_bytes())
    }

    fn __len__(&self) -> usize {
        self.inner.lock().len()
    }
}

#[pyclass(name = "Isolate", frozen)]
pub struct PyIsolate {
    inner: Isolate,
}

#[pymethods]
impl PyIsolate {
    #[new]
    #[pyo3(signature = (snapshot=None, *, max_heap_size=None, initial_heap_size=None))]
    fn py_new(
        py: Python<'_>,
        snapshot: Option<PyRef<'_, PySnapshot>>,
        max_heap_size: Option<usize>,
        initial_heap_size: Option<usize>,
    ) -> PyResult<Self> {
        let mut config = IsolateConfig::new();
        if let Some(snapshot) = snapshot {
            config = config.with_snapshot(snapshot.inner.lock().clone());
        }
        if let Some(bytes) = max_heap_size {
            config = config.with_max_heap_size(bytes);
        }
        if let Some(bytes) = initial_heap_size {
            config = config.with_initial_heap_size(bytes);
        }
        let inner = py.detach(|| Isolate::new(config)).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    #[getter]
    fn id(&self) -> u64 {
        self.inner.id()
    }

    #[getter]
    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    #[getter]
    fn context_count(&self) -> usize {
        self.inner.context_count()
    }

    fn interrupt(&self) -> bool {
        self.inner.interrupt()
    }

    #[pyo3(signature = (budget_ms=100))]
    fn idle_notification(&self, py: Python<'_>, budget_ms: u64) -> PyResult<bool> {
        py.detach(|| self.inner.idle_notification(budget_ms))
            .map_err(to_py_err)
    }

    fn heap_stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = py.detach(|| self.inner.heap_stats()).map_err(to_py_err)?;
        let dict = PyDict::new(py);
        dict.set_item("total_heap_size", stats.total_heap_size)?;
        dict.set_item("used_heap_size", stats.used_heap_size)?;
        dict.set_item("heap_size_limit", stats.heap_size_limit)?;
        dict.set_item("external_memory", stats.external_memory)?;
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        format!("{:?}", self.inner)
    }
}

#[pyclass(name = "Context", frozen)]
pub struct PyContext {
    inner: Mutex<Option<Arc<Context>>>,
}

impl PyContext {
    fn context(&self) -> PyResult<Arc<Context>> {
        self.inner
            .lock()
            .clone()
            .ok_or_else(|| to_py_err(BridgeError::ContextClosed))
    }
}

#[pymethods]
impl PyContext {
    #[new]
    #[pyo3(signature = (isolate=None, *, snapshot=None, timeout_ms=None, max_memory=None))]
    fn py_new(
        py: Python<'_>,
        isolate: Option<PyRef<'_, PyIsolate>>,
        snapshot: Option<PyRef<'_, PySnapshot>>,
        timeout_ms: Option<u64>,
        max_memory: Option<usize>,
    ) -> PyResult<Self> {
        let mut config = ContextConfig::new();
        if let Some(isolate) = isolate {
            config = config.with_isolate(isolate.inner.clone());
        } else if let Some(snapshot) = snapshot {
            config =
                config.with_isolate_config(IsolateConfig::new().with_snapshot(snapshot.inner.lock().clone()));
        }
        if let Some(ms) = timeout_ms {
            config = config.with_default_timeout(Duration::from_millis(ms));
        }
        if let Some(bytes) = max_memory {
            config = config.with_max_memory(bytes);
        }
        let context = py.detach(|| Context::new(config)).map_err(to_py_err)?;
        Ok(Self {
            inner: Mutex::new(Some(Arc::new(context))),
        })
    }

    #[pyo3(signature = (code, /, *, timeout_ms=None, max_memory=None))]
    fn eval(
        &self,
        py: Python<'_>,
        code: String,
        timeout_ms: Option<u64>,
        max_memory: Option<usize>,
    ) -> PyResult<Py<PyAny>> {
        let context = self.context()?;
        let options = eval_options(timeout_ms, max_memory);
        let value = py
            .detach(|| context.eval_with(&code, options))
            .map_err(to_py_err)?;
        js_value_to_python(py, &value)
    }

    #[pyo3(signature = (code, /, *, timeout_ms=None, max_memory=None))]
    fn eval_async<'py>(
        &self,
        py: Python<'py>,
        code: String,
        timeout_ms: Option<u64>,
        max_memory: Option<usize>,
    ) -> PyResult<Bound<'py, PyAny>> {
        let context = self.context()?;
        let options = eval_options(timeout_ms, max_memory);
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            let value = context
                .eval_async(&code, options)
                .await
                .map_err(to_py_err)?;
            Python::attach(|py| js_value_to_python(py, &value))
        })
    }

    /// Expose a Python callable to script at a dotted global path.
    fn attach(&self, py: Python<'_>, path: String, callable: Py<PyAny>) -> PyResult<()> {
        if !callable.bind(py).is_callable() {
            return Err(PyTypeError::new_err("attach() expects a callable"));
        }
        let context = self.context()?;
        py.detach(|| {
            context.attach(&path, move |args: Vec<JSValue>| {
                call_python(&callable, args)
            })
        })
        .map_err(to_py_err)
    }

    fn attached(&self) -> PyResult<Vec<String>> {
        Ok(self.context()?.attached())
    }

    fn stop(&self) -> PyResult<bool> {
        Ok(self.context()?.stop())
    }

    #[getter]
    fn last_outcome(&self) -> PyResult<Option<&'static str>> {
        Ok(self.context()?.last_outcome().map(|outcome| match outcome {
            EvalOutcome::Completed => "completed",
            EvalOutcome::TimedOut { .. } => "timed_out",
            EvalOutcome::Interrupted => "interrupted",
            EvalOutcome::Errored => "errored",
        }))
    }

    #[getter]
    fn isolate(&self) -> PyResult<PyIsolate> {
        Ok(PyIsolate {
            inner: self.context()?.isolate().clone(),
        })
    }

    #[getter]
    fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    fn dispose(&self, py: Python<'_>) {
        let context = self.inner.lock().take();
        // Dropping the last isolate reference joins its thread.
        py.detach(move || drop(context));
    }

    fn __enter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __exit__(
        &self,
        py: Python<'_>,
        _exc_type: Option<&Bound<'_, PyAny>>,
        _exc_value: Option<&Bound<'_, PyAny>>,
        _traceback: Option<&Bound<'_, PyAny>>,
    ) -> bool {
        self.dispose(py);
        false
    }
}
