//! Two-way bridge between Rust and an embedded JavaScript engine.
//!
//! Scripts run in [`Context`]s, each living inside an [`Isolate`] that owns
//! one engine heap on a dedicated thread. Host functions attached to a
//! context are callable from script, values cross the boundary as
//! [`JSValue`], and every evaluation can be bounded by a timeout or stopped
//! from another thread.

#[cfg(feature = "python")]
use pyo3::prelude::*;

mod runtime;

pub use runtime::{
    initialize_platform_once, is_platform_initialized, set_engine_flags, set_flags,
};
pub use runtime::{
    host_fn, BridgeError, Context, ContextConfig, EngineFlag, EvalOptions, EvalOutcome,
    FunctionRegistry, HeapStats, HostError, HostFunction, Isolate, IsolateConfig, JSValue,
    JsErrorValue, Snapshot, TerminationReason,
};
pub use runtime::js_value::{MAX_JS_BYTES, MAX_JS_DEPTH, MAX_SAFE_INTEGER};

/// Python jsbridge module
///
/// This module provides Python bindings to the bridge.
#[cfg(feature = "python")]
#[pymodule]
fn _jsbridge(m: &Bound<'_, PyModule>) -> PyResult<()> {
    runtime::python::register(m)
}
