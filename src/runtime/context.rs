//! Contexts - the unit scripts are evaluated in.
//!
//! Each context has its own global object and host-function registry and
//! lives inside an [`Isolate`], which it may share with other contexts.
//! All work is delegated to the isolate thread; evaluations on contexts of
//! the same isolate queue behind each other.
//!
//! ```no_run
//! use jsbridge::{Context, ContextConfig, JSValue};
//!
//! let ctx = Context::new(ContextConfig::default())?;
//! ctx.attach("math.add", |args: Vec<JSValue>| {
//!     let sum = args.iter().filter_map(JSValue::as_f64).sum::<f64>();
//!     Ok(JSValue::Float(sum))
//! })?;
//! assert_eq!(ctx.eval("math.add(1, 2)")?, JSValue::Int(3));
//! # Ok::<(), jsbridge::BridgeError>(())
//! ```

use crate::runtime::config::{ContextConfig, EvalOptions};
use crate::runtime::error::BridgeError;
use crate::runtime::isolate::Isolate;
use crate::runtime::js_value::JSValue;
use crate::runtime::ops::{HostError, HostFunction};
use crate::runtime::runner::{self, ContextShared, IsolateCommand};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// How the most recent evaluation on a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    Completed,
    /// The watchdog deadline elapsed.
    TimedOut { requested: Duration },
    /// Stopped by `stop()` / `Isolate::interrupt()`.
    Interrupted,
    /// Compile error, uncaught exception, or resource failure.
    Errored,
}

/// A global-object scope inside an isolate.
pub struct Context {
    isolate: Isolate,
    shared: Arc<ContextShared>,
    defaults: ContextConfig,
}

impl Context {
    /// Create a context on `config.isolate`, or on a private isolate built
    /// from `config.isolate_config` when none is given.
    pub fn new(mut config: ContextConfig) -> Result<Self, BridgeError> {
        let isolate = match config.isolate.take() {
            Some(isolate) => isolate,
            None => Isolate::new(config.isolate_config.clone())?,
        };

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ContextShared::new(id));

        // Created from a host function running on this isolate.
        let inline = runner::try_inline(isolate.id(), |scope| {
            runner::register_context(scope, shared.clone())
        });
        match inline {
            Some(result) => result?,
            None => isolate.commands().request(|responder| IsolateCommand::CreateContext {
                shared: shared.clone(),
                responder,
            })?,
        }
        isolate.context_opened();

        Ok(Self {
            isolate,
            shared,
            defaults: config,
        })
    }

    /// Create a context on an existing isolate.
    pub fn with_isolate(isolate: &Isolate) -> Result<Self, BridgeError> {
        Self::new(ContextConfig::new().with_isolate(isolate.clone()))
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn isolate(&self) -> &Isolate {
        &self.isolate
    }

    /// Evaluate `source` with the context's default options.
    pub fn eval(&self, source: &str) -> Result<JSValue, BridgeError> {
        self.eval_with(source, EvalOptions::default())
    }

    /// Evaluate `source`, blocking the calling thread until it finishes.
    ///
    /// From inside a host function on the same isolate the evaluation runs
    /// immediately on the active scope; its timeout is ignored and the outer
    /// evaluation's deadline applies.
    pub fn eval_with(&self, source: &str, options: EvalOptions) -> Result<JSValue, BridgeError> {
        if let Some(result) = runner::try_inline(self.isolate.id(), |scope| {
            runner::eval_inline(scope, self.shared.id, source)
        }) {
            return result;
        }
        let options = options.or_defaults(&self.defaults);
        self.isolate
            .commands()
            .request(|responder| IsolateCommand::Eval {
                context: self.shared.id,
                source: source.to_string(),
                options,
                responder,
            })
    }

    /// Evaluate `source` without blocking the async executor.
    pub async fn eval_async(
        &self,
        source: &str,
        options: EvalOptions,
    ) -> Result<JSValue, BridgeError> {
        let options = options.or_defaults(&self.defaults);
        self.isolate
            .commands()
            .request_async(|responder| IsolateCommand::Eval {
                context: self.shared.id,
                source: source.to_string(),
                options,
                responder,
            })
            .await
    }

    /// Expose `function` to script at the dotted global `path`.
    ///
    /// Missing intermediate objects are created. Attaching the same path
    /// again replaces the function.
    pub fn attach<F>(&self, path: &str, function: F) -> Result<(), BridgeError>
    where
        F: Fn(Vec<JSValue>) -> Result<JSValue, HostError> + Send + Sync + 'static,
    {
        self.attach_function(path, Arc::new(function))
    }

    pub fn attach_function(
        &self,
        path: &str,
        function: Arc<dyn HostFunction>,
    ) -> Result<(), BridgeError> {
        let context = self.shared.id;
        if let Some(result) = runner::try_inline(self.isolate.id(), |scope| {
            runner::attach_in_scope(scope, context, path, function.clone())
        }) {
            return result;
        }
        self.isolate
            .commands()
            .request(|responder| IsolateCommand::Attach {
                context,
                path: path.to_string(),
                function,
                responder,
            })
    }

    /// Paths of all attached host functions, sorted.
    pub fn attached(&self) -> Vec<String> {
        self.shared.registry.paths()
    }

    /// Interrupt whatever is running on this context's isolate.
    pub fn stop(&self) -> bool {
        self.isolate.interrupt()
    }

    /// How the most recent top-level evaluation ended.
    pub fn last_outcome(&self) -> Option<EvalOutcome> {
        self.shared.last_outcome()
    }

    /// Release the context. Equivalent to dropping it.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Fire and forget: the context may be dropped from its own isolate thread.
        let _ = self.isolate.commands().post(IsolateCommand::DropContext {
            context: self.shared.id,
        });
        self.isolate.context_closed();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.shared.id)
            .field("isolate", &self.isolate.id())
            .field("attached", &self.attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::IsolateConfig;
    use indexmap::IndexMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn context() -> Context {
        Context::new(ContextConfig::default()).unwrap()
    }

    #[test]
    fn test_eval_scalars() {
        let ctx = context();
        assert_eq!(ctx.eval("1 + 1").unwrap(), JSValue::Int(2));
        assert_eq!(ctx.eval("'a' + 'b'").unwrap(), JSValue::from("ab"));
        assert_eq!(ctx.eval("null").unwrap(), JSValue::Null);
        assert_eq!(ctx.eval("0.5 * 3").unwrap(), JSValue::Float(1.5));
    }

    #[test]
    fn test_globals_persist_between_evals() {
        let ctx = context();
        ctx.eval("var counter = 10;").unwrap();
        ctx.eval("counter += 5;").unwrap();
        assert_eq!(ctx.eval("counter").unwrap(), JSValue::Int(15));
        assert_eq!(ctx.last_outcome(), Some(EvalOutcome::Completed));
    }

    #[test]
    fn test_contexts_on_one_isolate_are_separate() {
        let isolate = Isolate::new(IsolateConfig::default()).unwrap();
        let first = Context::with_isolate(&isolate).unwrap();
        let second = Context::with_isolate(&isolate).unwrap();
        assert_eq!(isolate.context_count(), 2);

        first.eval("var x = 1").unwrap();
        second.eval("var x = 2").unwrap();
        assert_eq!(first.eval("x").unwrap(), JSValue::Int(1));
        assert_eq!(second.eval("x").unwrap(), JSValue::Int(2));
    }

    #[test]
    fn test_compile_error() {
        let ctx = context();
        let err = ctx.eval("function (").unwrap_err();
        match err {
            BridgeError::Compile { message } => assert!(message.contains("SyntaxError")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(ctx.last_outcome(), Some(EvalOutcome::Errored));
    }

    #[test]
    fn test_runtime_error_carries_thrown_value() {
        let ctx = context();
        match ctx.eval("throw new RangeError('bad range')").unwrap_err() {
            BridgeError::Runtime {
                value: JSValue::Error(error),
            } => {
                assert_eq!(error.name, "RangeError");
                assert_eq!(error.message, "bad range");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        match ctx.eval("throw 42").unwrap_err() {
            BridgeError::Runtime { value } => assert_eq!(value, JSValue::Int(42)),
            other => panic!("unexpected error: {:?}", other),
        }
        // The context stays usable.
        assert_eq!(ctx.eval("2").unwrap(), JSValue::Int(2));
    }

    #[test]
    fn test_cyclic_result_rejected() {
        let ctx = context();
        let err = ctx.eval("var o = {}; o.o = o; o").unwrap_err();
        assert!(matches!(err, BridgeError::CyclicValue(_)));
    }

    #[test]
    fn test_function_result_is_unsupported_marker() {
        let ctx = context();
        assert_eq!(
            ctx.eval("(function () {})").unwrap(),
            JSValue::Unsupported("function".to_string())
        );
    }

    #[test]
    fn test_timeout_terminates_infinite_loop() {
        let ctx = context();
        let started = Instant::now();
        let err = ctx
            .eval_with("while (true) {}", EvalOptions::default().with_timeout_ms(1000))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            err,
            BridgeError::ScriptTerminated {
                reason: crate::runtime::error::TerminationReason::Timeout { .. }
            }
        ));
        assert_eq!(
            ctx.last_outcome(),
            Some(EvalOutcome::TimedOut {
                requested: Duration::from_millis(1000)
            })
        );
        // The isolate recovers for the next evaluation.
        assert_eq!(ctx.eval("'alive'").unwrap(), JSValue::from("alive"));
    }

    #[test]
    fn test_default_timeout_from_config() {
        let ctx = Context::new(
            ContextConfig::new().with_default_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let err = ctx.eval("for (;;) {}").unwrap_err();
        assert!(err.is_terminated());
    }

    #[test]
    fn test_timeout_cannot_be_caught_by_script() {
        let ctx = context();
        let err = ctx
            .eval_with(
                "try { while (true) {} } catch (e) { 'caught' }",
                EvalOptions::default().with_timeout_ms(200),
            )
            .unwrap_err();
        assert!(err.is_terminated());
    }

    #[test]
    fn test_stop_from_another_thread() {
        let ctx = Arc::new(context());
        let runner = {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.eval("while (true) {}"))
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while !ctx.isolate().is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ctx.stop());

        let err = runner.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ScriptTerminated {
                reason: crate::runtime::error::TerminationReason::Interrupted
            }
        ));
        assert_eq!(ctx.last_outcome(), Some(EvalOutcome::Interrupted));
        assert_eq!(ctx.eval("1").unwrap(), JSValue::Int(1));
    }

    #[test]
    fn test_result_getters_run_past_the_deadline() {
        let ctx = context();
        let value = ctx
            .eval_with(
                "({ get slow() { var t = Date.now(); while (Date.now() - t < 300) {} return 1; } })",
                EvalOptions::default().with_timeout_ms(50),
            )
            .unwrap();

        let mut expected = IndexMap::new();
        expected.insert("slow".to_string(), JSValue::Int(1));
        assert_eq!(value, JSValue::Object(expected));
        assert_eq!(ctx.last_outcome(), Some(EvalOutcome::Completed));
    }

    #[test]
    fn test_stop_reaches_result_getters() {
        let ctx = Arc::new(context());
        let runner = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                ctx.eval_with(
                    "({ get forever() { while (true) {} } })",
                    EvalOptions::default().with_timeout_ms(50),
                )
            })
        };

        // Well past the deadline, so only the stop can end the getter.
        std::thread::sleep(Duration::from_millis(300));
        assert!(ctx.isolate().is_running());
        assert!(ctx.stop());

        let err = runner.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ScriptTerminated {
                reason: crate::runtime::error::TerminationReason::Interrupted
            }
        ));
        assert_eq!(ctx.last_outcome(), Some(EvalOutcome::Interrupted));
        assert_eq!(ctx.eval("2").unwrap(), JSValue::Int(2));
    }

    #[test]
    fn test_stop_when_idle_does_not_poison_next_eval() {
        let ctx = context();
        assert!(!ctx.stop());
        assert_eq!(ctx.eval("3").unwrap(), JSValue::Int(3));
    }

    #[test]
    fn test_attach_nested_path_called_once() {
        let ctx = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        ctx.attach("a.b.c", move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(JSValue::Array(args))
        })
        .unwrap();

        let result = ctx.eval("a.b.c(1, 2)").unwrap();
        assert_eq!(
            result,
            JSValue::Array(vec![JSValue::Int(1), JSValue::Int(2)])
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.attached(), vec!["a.b.c".to_string()]);
        assert_eq!(ctx.eval("typeof a.b").unwrap(), JSValue::from("object"));
    }

    #[test]
    fn test_attach_shares_existing_namespace() {
        let ctx = context();
        ctx.attach("ns.one", |_| Ok(JSValue::Int(1))).unwrap();
        ctx.attach("ns.two", |_| Ok(JSValue::Int(2))).unwrap();
        assert_eq!(ctx.eval("ns.one() + ns.two()").unwrap(), JSValue::Int(3));
        assert_eq!(ctx.eval("ns.one.name").unwrap(), JSValue::from("one"));
    }

    #[test]
    fn test_attach_name_conflict_rolls_back() {
        let ctx = context();
        ctx.eval("var taken = 5; var list = [];").unwrap();

        for path in ["taken.fn", "list.fn"] {
            match ctx.attach(path, |_| Ok(JSValue::Null)).unwrap_err() {
                BridgeError::NameConflict { path: p, segment } => {
                    assert_eq!(p, path);
                    assert_eq!(segment, path.split('.').next().unwrap());
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }
        assert!(ctx.attached().is_empty());
        assert_eq!(ctx.eval("taken").unwrap(), JSValue::Int(5));
    }

    #[test]
    fn test_attach_into_frozen_namespace_rolls_back() {
        let ctx = context();
        ctx.eval("var ns = Object.freeze({});").unwrap();

        match ctx.attach("ns.f", |_| Ok(JSValue::Null)).unwrap_err() {
            BridgeError::NameConflict { path, segment } => {
                assert_eq!(path, "ns.f");
                assert_eq!(segment, "f");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(ctx.attached().is_empty());
        assert_eq!(ctx.eval("typeof ns.f").unwrap(), JSValue::from("undefined"));
    }

    #[test]
    fn test_attach_over_read_only_global_rolls_back() {
        let ctx = context();
        assert!(matches!(
            ctx.attach("NaN", |_| Ok(JSValue::Null)),
            Err(BridgeError::NameConflict { .. })
        ));
        assert!(ctx.attached().is_empty());
        assert_eq!(ctx.eval("typeof NaN").unwrap(), JSValue::from("number"));
    }

    #[test]
    fn test_attach_rejects_invalid_path() {
        let ctx = context();
        assert!(matches!(
            ctx.attach("a..b", |_| Ok(JSValue::Null)),
            Err(BridgeError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_reattach_replaces_function() {
        let ctx = context();
        ctx.attach("version", |_| Ok(JSValue::Int(1))).unwrap();
        assert_eq!(ctx.eval("version()").unwrap(), JSValue::Int(1));
        ctx.attach("version", |_| Ok(JSValue::Int(2))).unwrap();
        assert_eq!(ctx.eval("version()").unwrap(), JSValue::Int(2));
    }

    #[test]
    fn test_host_values_cross_both_ways() {
        let ctx = context();
        ctx.attach("describe", |args| {
            let mut map = IndexMap::new();
            map.insert("count".to_string(), JSValue::Int(args.len() as i64));
            map.insert(
                "kinds".to_string(),
                JSValue::Array(args.iter().map(|a| JSValue::from(a.kind())).collect()),
            );
            Ok(JSValue::Object(map))
        })
        .unwrap();

        let result = ctx
            .eval("var r = describe(1, 2.5, 'x', null, [1], {a: 1}, true); r.kinds.join(',') + ':' + r.count")
            .unwrap();
        assert_eq!(
            result,
            JSValue::from("integer,double,string,null,array,object,boolean:7")
        );
    }

    #[test]
    fn test_host_error_is_catchable_in_script() {
        let ctx = context();
        ctx.attach("fail", |_| Err(HostError::named("QuotaError", "over quota")))
            .unwrap();

        let caught = ctx
            .eval("try { fail(); 'no' } catch (e) { e.name + ': ' + e.message + ':' + (e instanceof Error) }")
            .unwrap();
        assert_eq!(caught, JSValue::from("QuotaError: over quota:true"));

        match ctx.eval("fail()").unwrap_err() {
            BridgeError::Runtime {
                value: JSValue::Error(error),
            } => {
                assert_eq!(error.name, "QuotaError");
                assert_eq!(error.message, "over quota");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_cyclic_argument_becomes_type_error() {
        let ctx = context();
        ctx.attach("take", |_| Ok(JSValue::Null)).unwrap();
        let result = ctx
            .eval("var o = {}; o.self = o; try { take(o); 'no' } catch (e) { e.name }")
            .unwrap();
        assert_eq!(result, JSValue::from("TypeError"));
    }

    #[test]
    fn test_host_panic_becomes_script_error() {
        let ctx = context();
        ctx.attach("boom", |_| panic!("host bug")).unwrap();
        let result = ctx
            .eval("try { boom(); 'no' } catch (e) { 'caught' }")
            .unwrap();
        assert_eq!(result, JSValue::from("caught"));
    }

    #[test]
    fn test_nested_eval_from_host_function() {
        let ctx = Arc::new(context());
        let inner = Arc::downgrade(&ctx);
        ctx.eval("var base = 40;").unwrap();
        ctx.attach("nested", move |args| {
            let ctx = inner
                .upgrade()
                .ok_or_else(|| HostError::new("context gone"))?;
            let extra = args.first().and_then(JSValue::as_f64).unwrap_or(0.0);
            let base = ctx.eval("base")?;
            Ok(JSValue::Float(base.as_f64().unwrap_or(0.0) + extra))
        })
        .unwrap();

        assert_eq!(ctx.eval("nested(2)").unwrap(), JSValue::Int(42));
    }

    #[test]
    fn test_nested_attach_from_host_function() {
        let ctx = Arc::new(context());
        let inner = Arc::downgrade(&ctx);
        ctx.attach("install", move |_| {
            let ctx = inner
                .upgrade()
                .ok_or_else(|| HostError::new("context gone"))?;
            ctx.attach("late.value", |_| Ok(JSValue::from("late")))?;
            Ok(JSValue::Null)
        })
        .unwrap();

        assert_eq!(
            ctx.eval("install(); late.value()").unwrap(),
            JSValue::from("late")
        );
    }

    #[test]
    fn test_nested_eval_errors_propagate_as_host_errors() {
        let ctx = Arc::new(context());
        let inner = Arc::downgrade(&ctx);
        ctx.attach("evalInner", move |args| {
            let ctx = inner
                .upgrade()
                .ok_or_else(|| HostError::new("context gone"))?;
            let source = args.first().and_then(JSValue::as_str).unwrap_or("").to_string();
            Ok(ctx.eval(&source)?)
        })
        .unwrap();

        let result = ctx
            .eval("try { evalInner('throw new TypeError(\"inner\")') } catch (e) { e.name + ':' + e.message }")
            .unwrap();
        assert_eq!(result, JSValue::from("TypeError:inner"));
    }

    #[test]
    fn test_stop_interrupts_nested_chain() {
        let ctx = Arc::new(context());
        let inner = Arc::downgrade(&ctx);
        ctx.attach("spin", move |_| {
            let ctx = inner
                .upgrade()
                .ok_or_else(|| HostError::new("context gone"))?;
            Ok(ctx.eval("while (true) {}")?)
        })
        .unwrap();

        let err = ctx
            .eval_with("spin(); 'finished'", EvalOptions::default().with_timeout_ms(200))
            .unwrap_err();
        assert!(err.is_terminated());
        assert_eq!(ctx.eval("'ok'").unwrap(), JSValue::from("ok"));
    }

    #[test]
    fn test_mutual_exclusion_across_contexts() {
        let isolate = Isolate::new(IsolateConfig::default()).unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let contexts: Vec<Arc<Context>> = (0..3)
            .map(|_| {
                let ctx = Context::with_isolate(&isolate).unwrap();
                let (entering, max_seen) = (in_flight.clone(), max_seen.clone());
                ctx.attach("enter", move |_| {
                    let now = entering.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    Ok(JSValue::Null)
                })
                .unwrap();
                let leaving = in_flight.clone();
                ctx.attach("leave", move |_| {
                    leaving.fetch_sub(1, Ordering::SeqCst);
                    Ok(JSValue::Null)
                })
                .unwrap();
                Arc::new(ctx)
            })
            .collect();

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let ctx = contexts[i % contexts.len()].clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        ctx.eval("enter(); for (var i = 0; i < 20000; i++) {} leave(); i")
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_eval_async() {
        let ctx = context();
        ctx.eval_async("var y = 6", EvalOptions::default()).await.unwrap();
        assert_eq!(
            ctx.eval_async("y * 7", EvalOptions::default()).await.unwrap(),
            JSValue::Int(42)
        );
        let err = ctx
            .eval_async("while (true) {}", EvalOptions::default().with_timeout_ms(100))
            .await
            .unwrap_err();
        assert!(err.is_terminated());
    }

    #[test]
    fn test_max_memory_hint() {
        let ctx = context();
        let err = ctx
            .eval_with(
                "globalThis.keep = new Array(200000).fill(0).map((_, i) => ({ i })); 1",
                EvalOptions::default().with_max_memory(1024 * 1024),
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::Allocation(_)));
    }

    #[test]
    fn test_heap_limit_terminates_allocation() {
        let ctx = Context::new(ContextConfig::new().with_isolate_config(
            IsolateConfig::new().with_max_heap_size(16 * 1024 * 1024),
        ))
        .unwrap();
        let err = ctx
            .eval("(function () { var chunks = []; while (true) { chunks.push(new Array(100000).fill('x')); } })()")
            .unwrap_err();
        assert!(matches!(err, BridgeError::Allocation(_)));
        assert_eq!(ctx.last_outcome(), Some(EvalOutcome::Errored));
        assert_eq!(ctx.eval("1 + 2").unwrap(), JSValue::Int(3));
    }

    #[test]
    fn test_heap_limit_holds_after_repeated_hits() {
        let ctx = Context::new(ContextConfig::new().with_isolate_config(
            IsolateConfig::new().with_max_heap_size(16 * 1024 * 1024),
        ))
        .unwrap();
        let configured = ctx.isolate().heap_stats().unwrap().heap_size_limit;
        let runaway =
            "(function () { var chunks = []; while (true) { chunks.push(new Array(100000).fill('x')); } })()";

        for _ in 0..2 {
            let err = ctx.eval(runaway).unwrap_err();
            assert!(matches!(err, BridgeError::Allocation(_)));
            let limit = ctx.isolate().heap_stats().unwrap().heap_size_limit;
            // Raised only while the terminated script unwinds.
            assert!(
                limit < configured + configured / 2,
                "heap limit grew from {} to {}",
                configured,
                limit
            );
        }
        assert_eq!(ctx.eval("'ok'").unwrap(), JSValue::from("ok"));
    }

    #[test]
    fn test_dispose_releases_isolate_reference() {
        let isolate = Isolate::new(IsolateConfig::default()).unwrap();
        let ctx = Context::with_isolate(&isolate).unwrap();
        assert_eq!(isolate.context_count(), 1);
        ctx.dispose();
        assert_eq!(isolate.context_count(), 0);

        // The isolate outlives its contexts.
        let again = Context::with_isolate(&isolate).unwrap();
        assert_eq!(again.eval("'still here'").unwrap(), JSValue::from("still here"));
    }

    #[test]
    fn test_context_owns_private_isolate() {
        let ctx = context();
        let isolate = ctx.isolate().clone();
        assert_eq!(isolate.context_count(), 1);
        drop(ctx);
        assert_eq!(isolate.context_count(), 0);
        // Last reference: dropping joins the isolate thread.
        drop(isolate);
    }
}
