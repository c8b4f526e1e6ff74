//! Structured log delivery: records are routed by a [`Dispatcher`] to
//! handlers that format them (with optional color markup) and write them
//! to streams, rotating files or user callables, synchronously or from a
//! dedicated worker thread.

pub mod config;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod fallback;
pub mod file_sink;
pub mod format;
mod handler;
pub mod init;
pub mod layer;
pub mod markup;
pub mod metrics;
pub mod noop_sink;
pub mod record;
pub mod rotation;
pub mod sink;

pub use config::{Destination, Filter, HandlerConfig, Overflow};
pub use dispatcher::{Completion, Dispatcher, HandlerId, Target};
pub use error::{ConfigurationError, DeliveryError, FormatError, MarkupError, SinkError};
pub use format::Format;
pub use handler::StopMode;
pub use record::{Extra, Level, Record};
pub use sink::{Message, Sink};
