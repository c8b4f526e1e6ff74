use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

use log_pipeline::init::init_tracing;
use log_pipeline::noop_sink::NoopSink;
use log_pipeline::{Completion, Destination, Dispatcher, HandlerConfig, Target};

fn main() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher
        .register(HandlerConfig::new(Destination::sink(NoopSink)).enqueue(true))
        .expect("register noop handler");
    init_tracing(dispatcher.clone()).expect("install subscriber");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(target: "load", iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!(
        "default config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    let drained = dispatcher.complete(Target::All, Some(Duration::from_secs(10)));
    println!("drained in {:?}: {:?}", start.elapsed(), drained == Completion::Done);
}
