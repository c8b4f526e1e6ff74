//! Where record-time failures go when they cannot reach the caller.
//!
//! By default a single line is written to standard error. A handler may
//! install an [`ErrorCallback`] instead.

use std::sync::Arc;

use crate::error::DeliveryError;
use crate::record::Record;

/// Receives delivery failures of one handler.
pub type ErrorCallback = Arc<dyn Fn(&DeliveryError) + Send + Sync>;

/// Report `error` to `callback`, or to standard error when there is none.
pub(crate) fn report(callback: Option<&ErrorCallback>, error: &DeliveryError, record: Option<&Record>) {
    if let Some(callback) = callback {
        callback(error);
        return;
    }
    eprintln!("{}", describe(error, record));
}

pub(crate) fn describe(error: &DeliveryError, record: Option<&Record>) -> String {
    match record {
        Some(record) => {
            let origin = match &record.location {
                Some(loc) => format!("{}:{}", loc.name, loc.line),
                None => "<unknown>".to_string(),
            };
            format!(
                "log-pipeline: {error} [record: {} at {} from {origin}]",
                record.level.as_str(),
                record.time.to_rfc3339(),
            )
        }
        None => format!("log-pipeline: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SinkError, SinkOp};
    use crate::record::{Level, SourceLocation};
    use chrono::DateTime;
    use parking_lot::Mutex;
    use std::io;

    fn error() -> DeliveryError {
        DeliveryError::new(
            7,
            "stderr",
            SinkError::stream(SinkOp::Write, io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
        )
    }

    #[test]
    fn line_carries_handler_and_record_context() {
        let record = Record::builder(Level::Error, "boom")
            .time(DateTime::parse_from_rfc3339("2024-01-02T03:04:05+00:00").unwrap())
            .location(SourceLocation {
                name: "app::net".to_string(),
                function: "send".to_string(),
                file: "src/net.rs".to_string(),
                line: 12,
            })
            .build()
            .unwrap();
        assert_eq!(
            describe(&error(), Some(&record)),
            "log-pipeline: handler #7 (stderr): write failed: pipe closed \
             [record: ERROR at 2024-01-02T03:04:05+00:00 from app::net:12]"
        );
    }

    #[test]
    fn callback_replaces_standard_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ErrorCallback = Arc::new(move |e| sink.lock().push(e.handler_id));
        report(Some(&callback), &error(), None);
        assert_eq!(*seen.lock(), vec![7]);
    }
}
