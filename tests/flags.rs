//! Engine flags are process-wide and only take effect before the platform
//! starts, so they get their own test binary.

use jsbridge::{set_flags, BridgeError, Context, ContextConfig, JSValue};
use tracing_subscriber::EnvFilter;

#[test]
fn test_flags_apply_before_first_isolate_only() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    assert!(!jsbridge::is_platform_initialized());
    set_flags(["--expose-gc", "--stack-size=900"]).unwrap();

    let ctx = Context::new(ContextConfig::default()).unwrap();
    assert_eq!(ctx.eval("typeof gc").unwrap(), JSValue::from("function"));
    assert!(jsbridge::is_platform_initialized());

    let err = set_flags(["--no-expose-gc"]).unwrap_err();
    assert!(matches!(err, BridgeError::Configuration(_)));
    assert_eq!(ctx.eval("typeof gc").unwrap(), JSValue::from("function"));
}
