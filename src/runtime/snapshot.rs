//! Pre-built heap images.
//!
//! A [`Snapshot`] is produced by running source against a throwaway heap and
//! serializing the result. Snapshot creation enters a dedicated isolate, so
//! it always runs on a short-lived helper thread and never disturbs an
//! isolate the calling thread may already be inside of.
//!
//! The engine copies startup data into each isolate it boots, so a blob is
//! shared between snapshot clones and freed with the last one.

use crate::runtime::error::BridgeError;
use crate::runtime::initialize_platform_once;
use crate::runtime::runner::run_script;
use deno_core::v8;
use std::fmt;
use std::sync::Arc;

const MAGIC: &[u8; 8] = b"JSBRSNAP";
const FORMAT_VERSION: u16 = 1;

/// Immutable serialized heap image. Clones share one blob.
#[derive(Clone)]
pub struct Snapshot {
    blob: Arc<[u8]>,
}

impl Snapshot {
    /// Execute `source` in a fresh heap and capture the resulting state.
    pub fn create(source: &str) -> Result<Self, BridgeError> {
        let blob = on_helper_thread(|| build_blob(source))?;
        tracing::debug!(bytes = blob.len(), "Snapshot created");
        Ok(Self { blob: blob.into() })
    }

    /// Run `source` against a copy of this snapshot so the functions it
    /// touches are compiled, then keep the compiled code but not the
    /// side effects. On error the snapshot is unchanged.
    pub fn warmup(&mut self, source: &str) -> Result<(), BridgeError> {
        let existing = &self.blob;
        let blob = on_helper_thread(|| warm_blob(existing, source))?;
        tracing::debug!(bytes = blob.len(), "Snapshot warmed up");
        self.blob = blob.into();
        Ok(())
    }

    /// Raw engine blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub(crate) fn startup_data(&self) -> v8::StartupData {
        v8::StartupData::from(self.blob.to_vec())
    }

    pub fn len(&self) -> usize {
        self.blob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }

    /// Version string of the engine that produces and accepts snapshots.
    pub fn engine_version() -> &'static str {
        v8::V8::get_version()
    }

    /// Serialize with a header naming the engine version, for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        let version = Self::engine_version().as_bytes();
        let mut out = Vec::with_capacity(MAGIC.len() + 12 + version.len() + self.blob.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(version.len() as u16).to_le_bytes());
        out.extend_from_slice(version);
        out.extend_from_slice(&(self.blob.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.blob);
        out
    }

    /// Load bytes written by [`Snapshot::to_bytes`].
    ///
    /// Fails with [`BridgeError::SnapshotVersion`] when the bytes were
    /// produced by a different engine build.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BridgeError> {
        let mut reader = Reader { bytes };
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(malformed("missing header"));
        }
        let format = u16::from_le_bytes(reader.array()?);
        if format != FORMAT_VERSION {
            return Err(BridgeError::SnapshotVersion {
                expected: format!("format {}", FORMAT_VERSION),
                found: format!("format {}", format),
            });
        }

        let version_len = u16::from_le_bytes(reader.array()?) as usize;
        let version = String::from_utf8_lossy(reader.take(version_len)?).into_owned();
        if version != Self::engine_version() {
            return Err(BridgeError::SnapshotVersion {
                expected: Self::engine_version().to_string(),
                found: version,
            });
        }

        let blob_len = u64::from_le_bytes(reader.array()?) as usize;
        let blob = reader.take(blob_len)?;
        if !reader.bytes.is_empty() {
            return Err(malformed("trailing bytes"));
        }
        Ok(Self { blob: blob.into() })
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("bytes", &self.blob.len())
            .finish()
    }
}

fn malformed(what: &str) -> BridgeError {
    BridgeError::Configuration(format!("Malformed snapshot: {}", what))
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], BridgeError> {
        if self.bytes.len() < len {
            return Err(malformed("truncated"));
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BridgeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

fn on_helper_thread<T: Send>(
    f: impl FnOnce() -> Result<T, BridgeError> + Send,
) -> Result<T, BridgeError> {
    std::thread::scope(|s| {
        std::thread::Builder::new()
            .name("jsbridge-snapshot".to_string())
            .spawn_scoped(s, f)
            .map_err(|e| {
                BridgeError::Configuration(format!("Failed to spawn snapshot thread: {}", e))
            })?
            .join()
            .map_err(|_| BridgeError::Configuration("Snapshot thread panicked".to_string()))?
    })
}

fn build_blob(source: &str) -> Result<Vec<u8>, BridgeError> {
    initialize_platform_once();
    let mut creator = v8::Isolate::snapshot_creator(None, None);
    let result = {
        let scope = &mut v8::HandleScope::new(&mut creator);
        let context = v8::Context::new(scope, Default::default());
        let result = {
            let scope = &mut v8::ContextScope::new(scope, context);
            run_script(scope, source)
        };
        scope.set_default_context(context);
        result
    };
    // The creator must produce its blob before it is dropped, even on error.
    let blob = creator.create_blob(v8::FunctionCodeHandling::Clear);
    result?;
    blob.map(|data| data.to_vec())
        .ok_or_else(|| BridgeError::Allocation("Engine failed to serialize the heap".to_string()))
}

fn warm_blob(existing: &[u8], source: &str) -> Result<Vec<u8>, BridgeError> {
    initialize_platform_once();
    let mut creator = v8::Isolate::snapshot_creator_from_existing_snapshot(
        v8::StartupData::from(existing.to_vec()),
        None,
        None,
    );
    let result = {
        let scope = &mut v8::HandleScope::new(&mut creator);
        let warm = v8::Context::new(scope, Default::default());
        let result = {
            let scope = &mut v8::ContextScope::new(scope, warm);
            run_script(scope, source)
        };
        // Fresh context from the cold image: compiled code survives, state does not.
        let fresh = v8::Context::new(scope, Default::default());
        scope.set_default_context(fresh);
        result
    };
    let blob = creator.create_blob(v8::FunctionCodeHandling::Keep);
    result?;
    blob.map(|data| data.to_vec())
        .ok_or_else(|| BridgeError::Allocation("Engine failed to serialize the heap".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::js_value::JSValue;

    #[test]
    fn test_create_rejects_syntax_errors() {
        let err = Snapshot::create("function (").unwrap_err();
        assert!(matches!(err, BridgeError::Compile { .. }));
    }

    #[test]
    fn test_create_reports_thrown_errors() {
        let err = Snapshot::create("throw new TypeError('nope')").unwrap_err();
        match err {
            BridgeError::Runtime {
                value: JSValue::Error(error),
            } => {
                assert_eq!(error.name, "TypeError");
                assert_eq!(error.message, "nope");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_failed_warmup_keeps_snapshot() {
        let mut snapshot = Snapshot::create("var ready = true;").unwrap();
        let before = snapshot.blob().to_vec();
        let err = snapshot.warmup("missing()").unwrap_err();
        assert!(matches!(err, BridgeError::Runtime { .. }));
        assert_eq!(snapshot.blob(), &before[..]);
    }

    #[test]
    fn test_blob_freed_with_last_clone() {
        let snapshot = Snapshot::create("function ping() { return 'pong'; }").unwrap();
        let copy = snapshot.clone();
        assert_eq!(copy.blob().as_ptr(), snapshot.blob().as_ptr());
        let weak = Arc::downgrade(&snapshot.blob);

        let isolate = crate::runtime::Isolate::from_snapshot(copy).unwrap();
        drop(snapshot);
        let ctx = crate::runtime::Context::with_isolate(&isolate).unwrap();
        assert_eq!(ctx.eval("ping()").unwrap(), JSValue::from("pong"));
        assert!(weak.upgrade().is_some());

        drop(ctx);
        drop(isolate);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_bytes_round_trip() {
        let snapshot = Snapshot::create("var answer = 42;").unwrap();
        let restored = Snapshot::from_bytes(&snapshot.to_bytes()).unwrap();
        assert_eq!(restored.blob(), snapshot.blob());
    }

    #[test]
    fn test_from_bytes_rejects_other_engine_version() {
        let snapshot = Snapshot::create("1").unwrap();
        let mut bytes = snapshot.to_bytes();
        // First byte of the engine version string.
        let offset = MAGIC.len() + 4;
        bytes[offset] = if bytes[offset] == b'0' { b'1' } else { b'0' };
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(BridgeError::SnapshotVersion { .. })
        ));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(matches!(
            Snapshot::from_bytes(b"not a snapshot"),
            Err(BridgeError::Configuration(_))
        ));
        let mut bytes = Snapshot::create("1").unwrap().to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(BridgeError::Configuration(_))
        ));
    }
}
