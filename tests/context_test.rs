mod common;

use common::{new_context, overlay};
use openworkers_isolate_host::{
    Context, Error, Isolate, ScriptOrigin, SecurityToken, StackTraceOptions,
};
use serde_json::json;

fn calling() -> Option<Context> {
    Isolate::current().and_then(|isolate| isolate.calling_context())
}

#[test]
fn test_context_aliasing_shares_globals() {
    let isolate = Isolate::new(true);
    let first = new_context(&isolate);

    first.enter().unwrap();
    first.eval("let shared = 1;").unwrap();

    let second = Context::from_existing(&first);
    second.enter().unwrap();

    assert_eq!(second, first);
    assert_eq!(second.eval("shared").unwrap(), json!(1));

    second.eval("shared = 5;").unwrap();
    second.leave().unwrap();

    assert_eq!(first.eval("shared").unwrap(), json!(5));
    assert_eq!(first.locals().get("shared").unwrap(), Some(json!(5)));

    first.leave().unwrap();
}

#[test]
fn test_locals_bridge() {
    let isolate = Isolate::new(true);
    let context = new_context(&isolate);
    let globals = context.locals();

    globals.set("config", &json!({ "retries": 3 })).unwrap();
    assert!(globals.contains("config"));
    assert_eq!(context.eval("config.retries + 1").unwrap(), json!(4));

    context.eval("const LIMIT = 10;").unwrap();
    assert_eq!(globals.get("LIMIT").unwrap(), Some(json!(10)));
    assert!(matches!(
        globals.set("LIMIT", &json!(11)),
        Err(Error::InvalidState(_))
    ));

    assert_eq!(globals.get("missing").unwrap(), None);
    assert_eq!(globals.keys(), vec!["LIMIT".to_string(), "config".to_string()]);
}

#[test]
fn test_overlay_is_read_only_prototype() {
    let isolate = Isolate::new(true);
    let global = overlay(json!({ "region": "eu-west", "max": 3 }));
    let context = Context::new(&isolate, Some(global.clone()), &[]).unwrap();

    assert_eq!(context.eval("region").unwrap(), json!("eu-west"));
    assert!(matches!(context.eval("max = 4;"), Err(Error::Runtime(_))));

    // A script binding shadows the inherited one
    context.eval("let max = 4;").unwrap();
    assert_eq!(context.eval("max").unwrap(), json!(4));
    assert_eq!(global.get("max"), Some(&json!(3)));
    assert_eq!(context.locals().prototype(), Some(&global));
}

#[test]
fn test_security_token_defaults_and_reset() {
    let isolate = Isolate::new(true);
    let global = overlay(json!({ "app": "demo" }));

    let first = Context::new(&isolate, Some(global.clone()), &[]).unwrap();
    let second = Context::new(&isolate, Some(global), &[]).unwrap();

    assert_eq!(first.security_token(), second.security_token());
    assert!(first.security_token().is_default());
    assert!(first.can_access(&second));

    let token = SecurityToken::new("tenant-a");
    first.set_security_token(Some(token.clone()));
    assert_eq!(first.security_token(), token);
    assert_eq!(first.security_token().as_str(), Some("tenant-a"));
    assert!(!first.can_access(&second));

    first.set_security_token(None);
    assert_ne!(first.security_token(), token);
    assert_eq!(first.security_token(), second.security_token());
}

#[test]
fn test_compile_error_carries_origin() {
    let isolate = Isolate::new(true);
    let context = new_context(&isolate);

    let err = context
        .eval_with("let = ;", ScriptOrigin::new("broken.rhai"), None)
        .unwrap_err();

    match err {
        Error::Compile(script_error) => {
            assert_eq!(script_error.script_name, "broken.rhai");
            assert_eq!(script_error.line, Some(1));
        }
        other => panic!("expected compile error, got {:?}", other),
    }
}

#[test]
fn test_runtime_error_applies_line_offset() {
    let isolate = Isolate::new(true);
    let context = new_context(&isolate);

    let err = context
        .eval_with(
            "let x = 1;\nthrow \"boom\";",
            ScriptOrigin::with_position("app.rhai", 10, 5),
            None,
        )
        .unwrap_err();

    match err {
        Error::Runtime(script_error) => {
            assert_eq!(script_error.message, "boom");
            assert_eq!(script_error.script_name, "app.rhai");
            assert_eq!(script_error.line, Some(12));
        }
        other => panic!("expected runtime error, got {:?}", other),
    }

    // Globals set before the failure are kept
    assert_eq!(context.eval("x").unwrap(), json!(1));
}

#[test]
fn test_precompiled_script() {
    let isolate = Isolate::new(true);
    let context = new_context(&isolate);
    let source = "let total = 0; for i in 1..=10 { total += i; } total";

    let cache = isolate.precompile(source).unwrap();
    assert!(cache.matches(source));

    let value = context
        .eval_with(source, ScriptOrigin::default(), Some(&cache))
        .unwrap();
    assert_eq!(value, json!(55));

    // Cache for other source is ignored
    let value = context
        .eval_with("6 * 7", ScriptOrigin::default(), Some(&cache))
        .unwrap();
    assert_eq!(value, json!(42));
}

#[test]
fn test_calling_context_seen_from_host_function() {
    let isolate = Isolate::new(true);
    isolate
        .configure_engine(|engine| {
            engine.register_fn("calling_context", || -> i64 {
                Isolate::current()
                    .and_then(|isolate| isolate.calling_context())
                    .map(|context| context.id() as i64)
                    .unwrap_or(-1)
            });
            engine.register_fn("stack_depth", || -> i64 {
                Isolate::current()
                    .map(|isolate| {
                        isolate
                            .current_stack_trace(10, StackTraceOptions::DETAILED)
                            .len() as i64
                    })
                    .unwrap_or(-1)
            });
        })
        .unwrap();

    let context = new_context(&isolate);

    assert_eq!(
        context.eval("calling_context()").unwrap(),
        json!(context.id())
    );
    assert_eq!(context.eval("stack_depth()").unwrap(), json!(1));

    // Nothing runs outside eval
    assert!(isolate.calling_context().is_none());
    assert!(Isolate::current().is_none());
    assert!(
        isolate
            .current_stack_trace(10, StackTraceOptions::OVERVIEW)
            .is_empty()
    );
}

#[test]
fn test_configure_engine_refused_while_running() {
    let isolate = Isolate::new(true);
    isolate
        .configure_engine(|engine| {
            engine.register_fn("reconfigure", || -> bool {
                Isolate::current()
                    .map(|isolate| isolate.configure_engine(|_| {}).is_err())
                    .unwrap_or(false)
            });
        })
        .unwrap();

    let context = new_context(&isolate);
    assert_eq!(context.eval("reconfigure()").unwrap(), json!(true));
}

#[test]
fn test_script_print_is_not_a_value() {
    let isolate = Isolate::new(true);
    let context = new_context(&isolate);

    assert_eq!(context.eval("print(\"hello\");").unwrap(), json!(null));
    assert!(matches!(
        context.eval("|x| x + 1"),
        Err(Error::Marshal(_))
    ));
}

#[test]
fn test_writes_made_during_a_run_are_kept() {
    let isolate = Isolate::new(true);
    isolate
        .configure_engine(|engine| {
            engine.register_fn("define_inner", || -> bool {
                calling().is_some_and(|context| context.eval("let inner = 7;").is_ok())
            });
            engine.register_fn("bump_counter", || -> bool {
                calling().is_some_and(|context| context.eval("counter += 1;").is_ok())
            });
            engine.register_fn("set_flag", || -> bool {
                calling().is_some_and(|context| context.locals().set("flag", &json!(1)).is_ok())
            });
        })
        .unwrap();

    let context = new_context(&isolate);
    context.eval("let counter = 1;").unwrap();

    context
        .eval("define_inner(); bump_counter(); set_flag(); let local = 3;")
        .unwrap();

    assert_eq!(context.eval("inner").unwrap(), json!(7));
    assert_eq!(context.eval("counter").unwrap(), json!(2));
    assert_eq!(context.locals().get("flag").unwrap(), Some(json!(1)));
    assert_eq!(context.eval("local").unwrap(), json!(3));
}

#[test]
fn test_run_overwrites_bindings_it_changed() {
    let isolate = Isolate::new(true);
    let context = new_context(&isolate);

    context.eval("let items = [1, 2]; let name = \"a\";").unwrap();
    context.eval("items.push(3); name = \"b\";").unwrap();

    assert_eq!(context.eval("items").unwrap(), json!([1, 2, 3]));
    assert_eq!(context.eval("name").unwrap(), json!("b"));
}
