use std::path::Path;
use std::sync::Arc;

use crate::error::SinkError;
use crate::metrics::HandlerMetrics;
use crate::rotation::RotationManager;
use crate::sink::{Message, Sink};

/// Sink writing to a rotating file. Each record is stamped with its own
/// time, so time-based rotation follows record timestamps.
pub struct FileSink {
    manager: RotationManager,
    metrics: Option<Arc<HandlerMetrics>>,
}

impl FileSink {
    pub fn new(manager: RotationManager) -> Self {
        Self {
            manager,
            metrics: None,
        }
    }

    /// Count rotations into the handler's counters.
    pub(crate) fn with_metrics(mut self, metrics: Arc<HandlerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn path(&self) -> &Path {
        self.manager.path()
    }
}

impl Sink for FileSink {
    fn write(&mut self, message: &Message<'_>) -> Result<(), SinkError> {
        let rotated = self
            .manager
            .write(message.text.as_bytes(), message.record.time)?;
        if rotated {
            if let Some(metrics) = &self.metrics {
                metrics.inc_rotation_count();
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.manager.flush()
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.manager.close()
    }
}
