//! Error types surfaced by the bridge.

use crate::runtime::js_value::JSValue;
use std::fmt;
use std::time::Duration;

/// Why an evaluation was terminated before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The watchdog deadline elapsed.
    Timeout { requested: Duration },
    /// `stop()` / `interrupt()` was called from the host.
    Interrupted,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Timeout { requested } => {
                write!(f, "timed out after {}ms", requested.as_millis())
            }
            TerminationReason::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Errors that can occur while driving an isolate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Compile error: {message}")]
    Compile { message: String },

    #[error("JavaScript error: {}", describe_thrown(.value))]
    Runtime { value: JSValue },

    #[error("Script terminated: {reason}")]
    ScriptTerminated { reason: TerminationReason },

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Cyclic value: {0}")]
    CyclicValue(String),

    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),

    #[error("Snapshot was built by engine {found}, this build runs {expected}")]
    SnapshotVersion { expected: String, found: String },

    #[error("Cannot attach '{path}': segment '{segment}' is not a namespace object")]
    NameConflict { path: String, segment: String },

    #[error("Invalid function path '{0}'")]
    InvalidPath(String),

    #[error("Value conversion failed: {0}")]
    Conversion(String),

    #[error("Isolate has been shut down")]
    IsolateClosed,

    #[error("Context has been disposed")]
    ContextClosed,
}

impl BridgeError {
    /// True for failures caused by `stop()`, `interrupt()` or a timeout.
    pub fn is_terminated(&self) -> bool {
        matches!(self, BridgeError::ScriptTerminated { .. })
    }
}

fn describe_thrown(value: &JSValue) -> String {
    match value {
        JSValue::Error(err) => format!("{}: {}", err.name, err.message),
        JSValue::String(s) => s.clone(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::js_value::JsErrorValue;

    #[test]
    fn test_runtime_error_display_uses_error_name() {
        let err = BridgeError::Runtime {
            value: JSValue::Error(JsErrorValue::new("TypeError", "x is not a function")),
        };
        assert_eq!(
            err.to_string(),
            "JavaScript error: TypeError: x is not a function"
        );
    }

    #[test]
    fn test_termination_reason_display() {
        let reason = TerminationReason::Timeout {
            requested: Duration::from_millis(250),
        };
        assert_eq!(reason.to_string(), "timed out after 250ms");
        assert!(BridgeError::ScriptTerminated { reason }.is_terminated());
        assert!(!BridgeError::IsolateClosed.is_terminated());
    }
}
