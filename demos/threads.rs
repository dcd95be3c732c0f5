//! Several threads sharing one isolate and one context under a Locker.
//!
//! Run with `RUST_LOG=debug cargo run --example threads` to see lock traffic.

use openworkers_isolate_host::{Context, HostObject, Isolate, Locker};
use serde_json::json;
use std::sync::Arc;
use std::thread;

fn main() {
    env_logger::init();

    let isolate = Arc::new(Isolate::new(true));
    let global = HostObject::from_value(json!({ "greeting": "hello" })).unwrap();
    let context = Context::new(&isolate, Some(global), &[]).unwrap();

    context
        .eval(
            r#"
            let visits = [];
            fn visit(list, entry) { list.push(entry); list }
        "#,
        )
        .unwrap();

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let isolate = Arc::clone(&isolate);
            let context = context.clone();

            thread::spawn(move || {
                let mut locker = Locker::new(&isolate);
                locker.enter();

                let source = format!(r#"visits = visit(visits, greeting + " from thread-{}"); visits.len()"#, i);
                let count = context.eval(&source).unwrap();
                println!("thread-{} saw {} visits", i, count);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    println!("Visits: {}", context.eval("visits").unwrap());
    println!("Heap: {:?}", isolate.heap_statistics());
}
