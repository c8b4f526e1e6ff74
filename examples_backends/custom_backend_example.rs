use std::sync::Arc;

use tracing::{error, info};
use log_pipeline::error::SinkError;
use log_pipeline::init::init_tracing;
use log_pipeline::{Destination, Dispatcher, HandlerConfig, Message, Sink};

/// Example of integrating a completely custom destination by implementing
/// the `Sink` trait directly. Imagine this talks to some proprietary store
/// for which this crate does not provide a built-in sink.
struct MyCustomDbSink {
    rows: usize,
}

impl Sink for MyCustomDbSink {
    fn write(&mut self, message: &Message<'_>) -> Result<(), SinkError> {
        // Here you would call your own client library for the target store.
        self.rows += 1;
        println!(
            "[my-custom-db] row {} level={} extra={:?} text={}",
            self.rows,
            message.record.level,
            message.record.extra.resolve(),
            message.text.trim_end()
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        println!("[my-custom-db] closing after {} rows", self.rows);
        Ok(())
    }
}

fn main() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher
        .register(
            HandlerConfig::new(Destination::sink(MyCustomDbSink { rows: 0 }))
                .name("my-custom-db")
                .level("INFO")
                .serialize(true),
        )
        .expect("register custom sink");

    init_tracing(dispatcher.clone()).expect("install subscriber");

    info!(target: "example", "custom backend example started");
    error!(target: "example", db = "my-custom-db", "simulated error sent via custom backend");

    dispatcher.remove_all(Default::default());
}
