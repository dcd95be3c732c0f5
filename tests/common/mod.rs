#![allow(dead_code)]

use openworkers_isolate_host::{Context, HostObject, Isolate};
use serde_json::Value;

/// Route crate logs to the test output (`RUST_LOG=debug cargo test`).
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn new_context(isolate: &Isolate) -> Context {
    Context::new(isolate, None, &[]).expect("context creation failed")
}

pub fn overlay(value: Value) -> HostObject {
    HostObject::from_value(value).expect("overlay must be an object")
}

/// Id of the thread's active isolate, if any.
pub fn active_isolate_id() -> Option<u64> {
    Isolate::current().map(|isolate| isolate.id())
}
