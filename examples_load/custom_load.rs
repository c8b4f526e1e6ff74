use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

use log_pipeline::init::{init_tracing_with_config, LayerConfig};
use log_pipeline::noop_sink::NoopSink;
use log_pipeline::{Destination, Dispatcher, HandlerConfig, Overflow, Target};

fn main() {
    let dispatcher = Arc::new(Dispatcher::new());
    let id = dispatcher
        .register(
            HandlerConfig::new(Destination::sink(NoopSink))
                .level("ERROR")
                .format("{time} {level} {message} {extra}")
                .enqueue(true)
                .queue_capacity(50_000, Overflow::Drop),
        )
        .expect("register noop handler");

    init_tracing_with_config(dispatcher.clone(), LayerConfig { diagnostics: false })
        .expect("install subscriber");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(target: "load", iteration = i, "custom load test error");
    }

    let elapsed = start.elapsed();
    println!(
        "custom config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    dispatcher.complete(Target::Handler(id), Some(Duration::from_secs(10)));
    if let Some(metrics) = dispatcher.metrics(id) {
        println!(
            "written: {}, dropped: {}, failed: {}",
            metrics.write_count, metrics.dropped_count, metrics.failure_count
        );
    }
}
