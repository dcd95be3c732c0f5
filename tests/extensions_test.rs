mod common;

use common::new_context;
use openworkers_isolate_host::{Context, Error, Extension, Isolate, extensions, register_extension};
use serde_json::json;

fn register_fixtures() {
    register_extension(Extension::new("greeting", r#"fn greet(name) { "hello " + name }"#)).unwrap();
    register_extension(
        Extension::new("loud", r#"fn shout(name) { greet(name) + "!" }"#)
            .with_dependencies(["greeting"]),
    )
    .unwrap();
    register_extension(Extension::new("defaults", "let auto_loaded = true;").auto_enable()).unwrap();
    register_extension(Extension::new("broken", "let = ;")).unwrap();
}

#[test]
fn test_dependencies_are_installed_first() {
    register_fixtures();
    let isolate = Isolate::new(true);

    let context = Context::new(&isolate, None, &["loud"]).unwrap();

    assert_eq!(context.eval(r#"shout("bob")"#).unwrap(), json!("hello bob!"));
    assert_eq!(context.eval(r#"greet("amy")"#).unwrap(), json!("hello amy"));
}

#[test]
fn test_auto_enabled_extension_in_every_context() {
    register_fixtures();
    let isolate = Isolate::new(true);

    let context = new_context(&isolate);

    assert!(extensions::is_registered("defaults"));
    assert_eq!(context.eval("auto_loaded").unwrap(), json!(true));
}

#[test]
fn test_unknown_extension_is_skipped() {
    register_fixtures();
    let isolate = Isolate::new(true);

    let context = Context::new(&isolate, None, &["no-such-extension"]).unwrap();
    assert_eq!(context.eval("1 + 1").unwrap(), json!(2));
}

#[test]
fn test_extension_failures_are_initialization_errors() {
    register_fixtures();
    let isolate = Isolate::new(true);

    assert!(matches!(
        Context::new(&isolate, None, &["broken"]),
        Err(Error::Initialization(_))
    ));
    assert!(matches!(
        Context::new(&isolate, None, &[""]),
        Err(Error::Initialization(_))
    ));
}
