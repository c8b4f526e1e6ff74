use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use log_pipeline::init::init_tracing;
use log_pipeline::{Destination, Dispatcher, HandlerConfig, Target};

/// Writes to `logs/app.log`, rolling over every 4 KB, keeping the three
/// newest rotated files and compressing them. Colored output goes to
/// stderr at the same time.
fn main() {
    std::fs::create_dir_all("logs").expect("create logs directory");

    let dispatcher = Arc::new(Dispatcher::new());
    let file = dispatcher
        .register(
            HandlerConfig::new("logs/app.log")
                .level("DEBUG")
                .rotation("4 KB")
                .retention(3usize)
                .compression("zst")
                .enqueue(true),
        )
        .expect("register file handler");
    dispatcher
        .register(HandlerConfig::new(Destination::Stderr).level("WARNING"))
        .expect("register console handler");

    init_tracing(dispatcher.clone()).expect("install subscriber");

    for i in 0..500 {
        info!(target: "example", request = i, "handled request");
        if i % 100 == 0 {
            warn!(target: "example", request = i, "slow request");
        }
    }

    dispatcher.complete(Target::All, Some(Duration::from_secs(5)));
    if let Some(metrics) = dispatcher.metrics(file) {
        println!("rotations: {}", metrics.rotation_count);
    }
}
