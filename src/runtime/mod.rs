//! Host/engine execution bridge.
//!
//! Each [`Isolate`] owns one engine heap running on a dedicated OS thread.
//! [`Context`]s live inside an isolate and are where scripts run and host
//! functions are attached. Work for one isolate is serialized through its
//! command queue, so callers block (or await) without holding any lock of
//! their own while the engine runs.

pub mod config;
pub mod context;
pub(crate) mod conversion;
pub mod error;
pub(crate) mod handle;
pub mod isolate;
pub mod js_value;
pub mod ops;
#[cfg(feature = "python")]
pub mod python;
pub(crate) mod runner;
pub mod snapshot;
pub(crate) mod watchdog;

use deno_core::v8;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

/// Global engine platform.
///
/// The engine requires exactly one platform for the life of the process;
/// it is created on first use by an isolate, context or snapshot.
static V8_PLATFORM: OnceCell<v8::SharedRef<v8::Platform>> = OnceCell::new();

/// Serializes flag changes against platform initialization.
static PLATFORM_LOCK: Mutex<()> = Mutex::new(());

/// Initialize the engine platform exactly once.
///
/// Safe to call repeatedly; later calls are no-ops. After this returns,
/// engine flags can no longer be changed.
pub fn initialize_platform_once() {
    if V8_PLATFORM.get().is_some() {
        return;
    }
    let _guard = PLATFORM_LOCK.lock();
    V8_PLATFORM.get_or_init(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        tracing::debug!(version = v8::V8::get_version(), "Engine platform initialized");
        platform
    });
}

/// Check if the engine platform has been initialized.
pub fn is_platform_initialized() -> bool {
    V8_PLATFORM.get().is_some()
}

/// Parse and apply engine flags such as `--expose-gc` or
/// `--stack-size=512`.
///
/// Must run before the first isolate, context or snapshot is created.
/// Unknown flag names are passed through to the engine, which ignores them.
pub fn set_flags<I, S>(tokens: I) -> Result<(), BridgeError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let flags = tokens
        .into_iter()
        .map(|token| token.as_ref().parse::<EngineFlag>())
        .collect::<Result<Vec<_>, _>>()?;
    set_engine_flags(&flags)
}

/// Apply already-parsed engine flags. See [`set_flags`].
pub fn set_engine_flags(flags: &[EngineFlag]) -> Result<(), BridgeError> {
    for flag in flags {
        flag.validate()?;
    }

    let _guard = PLATFORM_LOCK.lock();
    if is_platform_initialized() {
        return Err(BridgeError::Configuration(
            "Engine flags must be set before the first isolate, context or snapshot is created"
                .to_string(),
        ));
    }
    if flags.is_empty() {
        return Ok(());
    }

    let joined = flags
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    tracing::debug!(flags = %joined, "Applying engine flags");
    v8::V8::set_flags_from_string(&joined);
    Ok(())
}

// Re-export key types for convenience
pub use config::{ContextConfig, EngineFlag, EvalOptions, IsolateConfig};
pub use context::{Context, EvalOutcome};
pub use error::{BridgeError, TerminationReason};
pub use isolate::{HeapStats, Isolate};
pub use js_value::{JSValue, JsErrorValue};
pub use ops::{host_fn, FunctionRegistry, HostError, HostFunction};
pub use snapshot::Snapshot;
