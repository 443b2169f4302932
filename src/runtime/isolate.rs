//! Engine isolate running on its own thread.

use crate::runtime::config::IsolateConfig;
use crate::runtime::error::BridgeError;
use crate::runtime::handle::CommandHandle;
use crate::runtime::runner::{
    self, heap_stats_inline, spawn_isolate_thread, IsolateCommand, IsolateId,
};
use crate::runtime::snapshot::Snapshot;
use crate::runtime::watchdog::Interrupter;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

static NEXT_ISOLATE_ID: AtomicU64 = AtomicU64::new(1);

/// Heap usage reported by the engine, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total_heap_size: usize,
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
    pub external_memory: usize,
}

struct IsolateInner {
    id: IsolateId,
    commands: CommandHandle,
    interrupter: Arc<Interrupter>,
    thread: Mutex<Option<JoinHandle<()>>>,
    snapshot: Option<Snapshot>,
    contexts: AtomicUsize,
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        // A host function may drop the last reference on the isolate thread
        // itself; the queued shutdown then runs once the current command ends.
        let _ = self.commands.post(IsolateCommand::Shutdown);
        if runner::is_isolate_thread(self.id) {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::warn!(isolate = self.id, "Isolate thread panicked");
            }
        }
    }
}

/// An exclusive-execution engine instance owning one heap.
///
/// Cloning is cheap; the heap is torn down when the last clone (including
/// the ones held by contexts) is dropped. Work submitted from any thread is
/// executed in arrival order, one item at a time.
#[derive(Clone)]
pub struct Isolate {
    inner: Arc<IsolateInner>,
}

impl Isolate {
    pub fn new(config: IsolateConfig) -> Result<Self, BridgeError> {
        let id = NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed);
        let snapshot = config.snapshot.clone();
        let spawned = spawn_isolate_thread(id, config)?;
        Ok(Self {
            inner: Arc::new(IsolateInner {
                id,
                commands: spawned.commands,
                interrupter: spawned.interrupter,
                thread: Mutex::new(Some(spawned.thread)),
                snapshot,
                contexts: AtomicUsize::new(0),
            }),
        })
    }

    /// Create an isolate seeded from `snapshot`.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, BridgeError> {
        Self::new(IsolateConfig::new().with_snapshot(snapshot))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Ask the running evaluation, if any, to stop at its next checkpoint.
    ///
    /// Returns false when nothing was running; the request is then dropped.
    pub fn interrupt(&self) -> bool {
        let delivered = self.inner.interrupter.interrupt();
        if delivered {
            tracing::debug!(isolate = self.inner.id, "Interrupt requested");
        }
        delivered
    }

    /// True while a top-level evaluation is executing.
    pub fn is_running(&self) -> bool {
        self.inner.interrupter.is_running()
    }

    /// Run a full garbage collection, blocking until it completes.
    ///
    /// Returns true when the collection finished within `budget_ms`. Called
    /// from inside a host function on this isolate it collects nothing and
    /// returns false.
    pub fn idle_notification(&self, budget_ms: u64) -> Result<bool, BridgeError> {
        if runner::is_isolate_thread(self.inner.id) {
            return Ok(false);
        }
        let budget = Duration::from_millis(budget_ms);
        self.inner
            .commands
            .request(|responder| IsolateCommand::IdleNotification { budget, responder })
    }

    pub fn heap_stats(&self) -> Result<HeapStats, BridgeError> {
        if let Some(stats) = runner::try_inline(self.inner.id, heap_stats_inline) {
            return Ok(stats);
        }
        self.inner
            .commands
            .request(|responder| IsolateCommand::HeapStats { responder })
    }

    /// Number of live contexts on this isolate.
    pub fn context_count(&self) -> usize {
        self.inner.contexts.load(Ordering::SeqCst)
    }

    /// Snapshot this isolate was created from.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.inner.snapshot.as_ref()
    }

    pub(crate) fn commands(&self) -> &CommandHandle {
        &self.inner.commands
    }

    pub(crate) fn context_opened(&self) {
        self.inner.contexts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn context_closed(&self) {
        self.inner.contexts.fetch_sub(1, Ordering::SeqCst);
    }

    /// True when both handles refer to the same isolate.
    pub fn same_isolate(&self, other: &Isolate) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.inner.id)
            .field("contexts", &self.context_count())
            .field("from_snapshot", &self.inner.snapshot.is_some())
            .finish()
    }
}
