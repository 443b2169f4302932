//! Termination authority for a single isolate.
//!
//! [`Interrupter`] is shared between the isolate thread and anything that
//! may stop a running evaluation: the host (`stop()` / `interrupt()`), the
//! per-evaluation [`Watchdog`] timer, and the near-heap-limit callback. The
//! first cause recorded during an evaluation wins; requests that arrive
//! while nothing is running are ignored.

use deno_core::v8;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

/// Why the running evaluation was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cause {
    Timeout(Duration),
    Interrupted,
    HeapLimit,
}

#[derive(Debug, Default)]
struct State {
    running: bool,
    generation: u64,
    deadline_open: bool,
    cause: Option<Cause>,
}

pub(crate) struct Interrupter {
    handle: v8::IsolateHandle,
    state: Mutex<State>,
}

impl Interrupter {
    pub(crate) fn new(handle: v8::IsolateHandle) -> Self {
        Self {
            handle,
            state: Mutex::new(State::default()),
        }
    }

    /// Open a new top-level evaluation, returning its generation token.
    ///
    /// Any termination left pending by an earlier evaluation is cleared.
    pub(crate) fn begin(&self) -> u64 {
        let mut state = self.state.lock();
        self.handle.cancel_terminate_execution();
        state.generation = state.generation.wrapping_add(1);
        state.running = true;
        state.deadline_open = true;
        state.cause = None;
        state.generation
    }

    /// Close the timeout window. Later watchdog expiries for this
    /// evaluation are ignored.
    pub(crate) fn close_deadline(&self) {
        self.state.lock().deadline_open = false;
    }

    /// End the current evaluation and report what stopped it, if anything.
    pub(crate) fn finish(&self) -> Option<Cause> {
        let mut state = self.state.lock();
        state.running = false;
        state.deadline_open = false;
        state.cause.take()
    }

    /// Cause recorded so far for the running evaluation.
    pub(crate) fn current_cause(&self) -> Option<Cause> {
        self.state.lock().cause
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Stop the running evaluation. Returns false when nothing was running.
    pub(crate) fn interrupt(&self) -> bool {
        let mut state = self.state.lock();
        if !state.running {
            return false;
        }
        if state.cause.is_none() {
            state.cause = Some(Cause::Interrupted);
        }
        self.handle.terminate_execution();
        true
    }

    /// Called by the watchdog when `generation`'s deadline passes.
    pub(crate) fn expire(&self, generation: u64, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.running || !state.deadline_open || state.generation != generation {
            return false;
        }
        if state.cause.is_none() {
            state.cause = Some(Cause::Timeout(timeout));
        }
        self.handle.terminate_execution();
        true
    }

    /// Called from the engine when the heap is about to run out.
    pub(crate) fn heap_limit(&self) {
        let mut state = self.state.lock();
        if state.cause.is_none() {
            state.cause = Some(Cause::HeapLimit);
        }
        self.handle.terminate_execution();
    }

    /// Clear a termination request without touching evaluation state.
    pub(crate) fn cancel_termination(&self) {
        self.handle.cancel_terminate_execution();
    }
}

fn watchdog_runtime() -> Option<&'static Runtime> {
    static RUNTIME: OnceCell<Option<Runtime>> = OnceCell::new();
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("jsbridge-watchdog")
                .enable_time()
                .build()
                .map_err(|err| tracing::error!("Failed to start watchdog runtime: {}", err))
                .ok()
        })
        .as_ref()
}

/// A deadline armed for one evaluation. Disarms on drop.
pub(crate) struct Watchdog {
    interrupter: Arc<Interrupter>,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Arm a timer that terminates evaluation `generation` after `timeout`.
    pub(crate) fn arm(interrupter: Arc<Interrupter>, generation: u64, timeout: Duration) -> Self {
        let task = match watchdog_runtime() {
            Some(runtime) => {
                let target = interrupter.clone();
                Some(runtime.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if target.expire(generation, timeout) {
                        tracing::debug!(
                            timeout_ms = timeout.as_millis() as u64,
                            "Evaluation deadline reached, terminating"
                        );
                    }
                }))
            }
            None => {
                tracing::warn!("Watchdog unavailable, evaluation runs without a deadline");
                None
            }
        };
        Self { interrupter, task }
    }

    pub(crate) fn disarm(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.interrupter.close_deadline();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::initialize_platform_once;

    fn interrupter() -> (v8::OwnedIsolate, Arc<Interrupter>) {
        initialize_platform_once();
        let isolate = v8::Isolate::new(Default::default());
        let interrupter = Arc::new(Interrupter::new(isolate.thread_safe_handle()));
        (isolate, interrupter)
    }

    #[test]
    fn test_interrupt_ignored_when_idle() {
        let (_isolate, interrupter) = interrupter();
        assert!(!interrupter.interrupt());
        interrupter.begin();
        assert_eq!(interrupter.finish(), None);
    }

    #[test]
    fn test_first_cause_wins() {
        let (_isolate, interrupter) = interrupter();
        let generation = interrupter.begin();
        assert!(interrupter.interrupt());
        assert!(interrupter.expire(generation, Duration::from_millis(5)));
        assert_eq!(interrupter.finish(), Some(Cause::Interrupted));
        assert!(!interrupter.is_running());
    }

    #[test]
    fn test_stale_generation_does_not_expire() {
        let (_isolate, interrupter) = interrupter();
        let first = interrupter.begin();
        interrupter.finish();
        let _second = interrupter.begin();
        assert!(!interrupter.expire(first, Duration::from_millis(1)));
        assert_eq!(interrupter.finish(), None);
    }

    #[test]
    fn test_closed_deadline_ignores_expiry() {
        let (_isolate, interrupter) = interrupter();
        let generation = interrupter.begin();
        interrupter.close_deadline();
        assert!(!interrupter.expire(generation, Duration::from_millis(1)));
        // Explicit interrupts still apply after the deadline closes.
        assert!(interrupter.interrupt());
        assert_eq!(interrupter.finish(), Some(Cause::Interrupted));
    }

    #[test]
    fn test_watchdog_fires_after_timeout() {
        let (_isolate, interrupter) = interrupter();
        let generation = interrupter.begin();
        let watchdog = Watchdog::arm(interrupter.clone(), generation, Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(300));
        drop(watchdog);
        assert_eq!(
            interrupter.finish(),
            Some(Cause::Timeout(Duration::from_millis(20)))
        );
    }

    #[test]
    fn test_disarmed_watchdog_never_fires() {
        let (_isolate, interrupter) = interrupter();
        let generation = interrupter.begin();
        Watchdog::arm(interrupter.clone(), generation, Duration::from_millis(20)).disarm();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(interrupter.finish(), None);
    }

    #[test]
    fn test_heap_limit_recorded_outside_deadline() {
        let (_isolate, interrupter) = interrupter();
        interrupter.begin();
        interrupter.close_deadline();
        interrupter.heap_limit();
        assert_eq!(interrupter.finish(), Some(Cause::HeapLimit));
    }
}
