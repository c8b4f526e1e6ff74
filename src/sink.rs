use crate::error::{BoxError, SinkError, SinkOp};
use crate::record::Record;
use std::io::{self, Write};

/// A formatted record handed to a sink.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    /// Final text: formatted, colorized or stripped, newline-terminated.
    pub text: &'a str,
    /// The record the text was produced from.
    pub record: &'a Record,
}

/// Physical destination for formatted records.
///
/// Implementations only move bytes; formatting, filtering and error
/// containment happen in the handler that owns the sink. A sink is used by
/// one thread at a time: either under the handler's mutex or from the
/// handler's queue worker.
pub trait Sink: Send {
    /// Write a single formatted record.
    ///
    /// **Parameters**
    /// - `message`: the record's final text together with the record.
    ///
    /// **Returns**
    /// - `Ok(())` if the sink accepted the record.
    /// - `Err(..)` if the underlying write failed. The handler reports or
    ///   propagates it according to its `catch` setting.
    fn write(&mut self, message: &Message<'_>) -> Result<(), SinkError>;

    /// Flush any buffered output. Default implementation is a no-op.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Release resources. Called once, when the handler is removed.
    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()
    }
}

/// Writes to any `io::Write`, flushing after every record.
pub struct StreamSink {
    writer: Box<dyn Write + Send>,
}

impl StreamSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { writer }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(io::stderr()))
    }
}

impl Sink for StreamSink {
    fn write(&mut self, message: &Message<'_>) -> Result<(), SinkError> {
        self.writer
            .write_all(message.text.as_bytes())
            .map_err(|e| SinkError::stream(SinkOp::Write, e))?;
        self.flush()
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer
            .flush()
            .map_err(|e| SinkError::stream(SinkOp::Flush, e))
    }
}

/// User function receiving each formatted record.
pub type SinkFn = Box<dyn FnMut(&Message<'_>) -> Result<(), BoxError> + Send>;

/// Adapts a user callable into a [`Sink`].
pub struct CallableSink {
    f: SinkFn,
}

impl CallableSink {
    pub fn new(f: SinkFn) -> Self {
        Self { f }
    }
}

impl Sink for CallableSink {
    fn write(&mut self, message: &Message<'_>) -> Result<(), SinkError> {
        (self.f)(message).map_err(SinkError::Callable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Level;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stream_sink_writes_text() {
        let buf = SharedBuf::default();
        let mut sink = StreamSink::new(Box::new(buf.clone()));
        let record = Record::builder(Level::Info, "x").build().unwrap();
        sink.write(&Message {
            text: "line\n",
            record: &record,
        })
        .unwrap();
        assert_eq!(buf.0.lock().as_slice(), b"line\n");
    }

    #[test]
    fn callable_errors_are_wrapped() {
        let mut sink = CallableSink::new(Box::new(|_| Err("boom".into())));
        let record = Record::builder(Level::Info, "x").build().unwrap();
        let err = sink
            .write(&Message {
                text: "",
                record: &record,
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "callable sink failed: boom");
    }
}
