use crate::error::SinkError;
use crate::sink::{Message, Sink};

/// A sink that simply drops all records.
///
/// Useful for measuring the overhead of the pipeline itself without any
/// I/O, and for tests that only care about routing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl Sink for NoopSink {
    fn write(&mut self, _message: &Message<'_>) -> Result<(), SinkError> {
        Ok(())
    }
}
