//! Registration options of a handler.
//!
//! [`HandlerConfig`] is a plain builder. Nothing is opened or spawned
//! until [`Dispatcher::register`] validates it; any inconsistency is
//! reported as a [`ConfigurationError`] and no handler is created.
//!
//! [`Dispatcher::register`]: crate::dispatcher::Dispatcher::register

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{BoxError, ConfigurationError};
use crate::fallback::ErrorCallback;
use crate::format::{Format, Renderer};
use crate::markup::MarkupParser;
use crate::record::{Level, Record};
use crate::rotation::{Compression, PathPattern, Retention, Rotation, RotationPolicy, Setting};
use crate::sink::{CallableSink, Message, Sink, SinkFn, StreamSink};

/// Where a handler writes.
pub enum Destination {
    Stdout,
    Stderr,
    /// Any writer, flushed after each record.
    Writer(Box<dyn Write + Send>),
    /// File path, optionally with a `{time}` placeholder in the file name.
    File(PathBuf),
    /// User function receiving each formatted record.
    Callable(SinkFn),
    /// Custom sink implementation.
    Sink(Box<dyn Sink>),
}

impl Destination {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Destination::File(path.into())
    }

    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Destination::Writer(Box::new(writer))
    }

    pub fn callable<F>(f: F) -> Self
    where
        F: FnMut(&Message<'_>) -> Result<(), BoxError> + Send + 'static,
    {
        Destination::Callable(Box::new(f))
    }

    pub fn sink(sink: impl Sink + 'static) -> Self {
        Destination::Sink(Box::new(sink))
    }

    /// Display name used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Destination::Stdout => "<stdout>".to_string(),
            Destination::Stderr => "<stderr>".to_string(),
            Destination::Writer(_) => "<writer>".to_string(),
            Destination::File(path) => path.display().to_string(),
            Destination::Callable(_) => "<callable>".to_string(),
            Destination::Sink(_) => "<sink>".to_string(),
        }
    }

    fn is_terminal(&self) -> bool {
        match self {
            Destination::Stdout => io::stdout().is_terminal(),
            Destination::Stderr => io::stderr().is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl From<PathBuf> for Destination {
    fn from(path: PathBuf) -> Self {
        Destination::File(path)
    }
}

impl From<&str> for Destination {
    fn from(path: &str) -> Self {
        Destination::File(PathBuf::from(path))
    }
}

/// Predicate applied after the level check.
#[derive(Clone)]
pub enum Filter {
    /// Module path prefix, matched on `::` boundaries. Empty matches all.
    Module(String),
    /// Per-module minimum level. Longest matching prefix wins; records from
    /// unlisted modules pass.
    Levels(BTreeMap<String, Level>),
    Fn(Arc<dyn Fn(&Record) -> bool + Send + Sync>),
}

impl Filter {
    pub fn module(prefix: impl Into<String>) -> Self {
        Filter::Module(prefix.into())
    }

    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Filter::Fn(Arc::new(f))
    }

    pub(crate) fn accepts(&self, record: &Record) -> bool {
        match self {
            Filter::Module(prefix) => in_module(record.module(), prefix),
            Filter::Levels(levels) => levels
                .iter()
                .filter(|(prefix, _)| in_module(record.module(), prefix))
                .max_by_key(|(prefix, _)| prefix.len())
                .map_or(true, |(_, level)| record.level >= *level),
            Filter::Fn(f) => f(record),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Module(prefix) => f.debug_tuple("Module").field(prefix).finish(),
            Filter::Levels(levels) => f.debug_tuple("Levels").field(levels).finish(),
            Filter::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

fn in_module(module: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || module == prefix
        || module
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with("::"))
}

/// What a producer does when a bounded queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Overflow {
    /// Wait for room.
    #[default]
    Block,
    /// Discard the record and count it.
    Drop,
}

impl From<Level> for Setting<Level> {
    fn from(level: Level) -> Self {
        Setting::Value(level)
    }
}

impl From<&str> for Setting<Level> {
    fn from(name: &str) -> Self {
        Setting::Text(name.to_string())
    }
}

/// Options of one handler.
pub struct HandlerConfig {
    destination: Destination,
    name: Option<String>,
    level: Setting<Level>,
    filter: Option<Filter>,
    format: Format,
    colorize: Option<bool>,
    serialize: bool,
    catch: bool,
    enqueue: bool,
    queue_capacity: Option<usize>,
    overflow: Overflow,
    rotation: Option<Setting<Rotation>>,
    retention: Option<Setting<Retention>>,
    compression: Option<Setting<Compression>>,
    utc: bool,
    multiprocess: bool,
    on_error: Option<ErrorCallback>,
    markup_max_depth: Option<usize>,
}

impl HandlerConfig {
    /// Defaults: level DEBUG, default format, auto colors, `catch` on,
    /// synchronous delivery.
    pub fn new(destination: impl Into<Destination>) -> Self {
        Self {
            destination: destination.into(),
            name: None,
            level: Setting::Value(Level::Debug),
            filter: None,
            format: Format::default(),
            colorize: None,
            serialize: false,
            catch: true,
            enqueue: false,
            queue_capacity: None,
            overflow: Overflow::Block,
            rotation: None,
            retention: None,
            compression: None,
            utc: false,
            multiprocess: false,
            on_error: None,
            markup_max_depth: None,
        }
    }

    /// Name shown in diagnostics. Defaults to a description of the destination.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn level(mut self, level: impl Into<Setting<Level>>) -> Self {
        self.level = level.into();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn format(mut self, format: impl Into<Format>) -> Self {
        self.format = format.into();
        self
    }

    pub fn format_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> String + Send + Sync + 'static,
    {
        self.format = Format::Function(Arc::new(f));
        self
    }

    /// Force ANSI colors on or off. Unset: only terminals are colorized.
    pub fn colorize(mut self, colorize: bool) -> Self {
        self.colorize = Some(colorize);
        self
    }

    /// Write each record as a JSON line.
    pub fn serialize(mut self, serialize: bool) -> Self {
        self.serialize = serialize;
        self
    }

    /// Contain record-time failures instead of returning them to the caller.
    pub fn catch(mut self, catch: bool) -> Self {
        self.catch = catch;
        self
    }

    /// Deliver from a dedicated worker thread.
    pub fn enqueue(mut self, enqueue: bool) -> Self {
        self.enqueue = enqueue;
        self
    }

    /// Bound the queue. Unbounded when unset.
    pub fn queue_capacity(mut self, capacity: usize, overflow: Overflow) -> Self {
        self.queue_capacity = Some(capacity);
        self.overflow = overflow;
        self
    }

    pub fn rotation(mut self, rotation: impl Into<Setting<Rotation>>) -> Self {
        self.rotation = Some(rotation.into());
        self
    }

    pub fn retention(mut self, retention: impl Into<Setting<Retention>>) -> Self {
        self.retention = Some(retention.into());
        self
    }

    pub fn compression(mut self, compression: impl Into<Setting<Compression>>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Use UTC for file name timestamps and daily rotation.
    pub fn utc(mut self, utc: bool) -> Self {
        self.utc = utc;
        self
    }

    /// Share the file safely with other processes.
    pub fn multiprocess(mut self, multiprocess: bool) -> Self {
        self.multiprocess = multiprocess;
        self
    }

    /// Receive delivery failures instead of the standard error line.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::error::DeliveryError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Override the markup nesting limit for this handler.
    pub fn markup_max_depth(mut self, depth: usize) -> Self {
        self.markup_max_depth = Some(depth);
        self
    }

    /// Check every option and resolve text settings. Opens nothing.
    pub(crate) fn validate(self) -> Result<Plan, ConfigurationError> {
        let is_file = matches!(self.destination, Destination::File(_));
        if !is_file
            && (self.rotation.is_some()
                || self.retention.is_some()
                || self.compression.is_some()
                || self.multiprocess)
        {
            return Err(ConfigurationError::Conflict(
                "rotation, retention, compression and multiprocess require a file destination",
            ));
        }
        if self.queue_capacity.is_some() && !self.enqueue {
            return Err(ConfigurationError::Conflict(
                "queue capacity requires enqueue",
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigurationError::Conflict("queue capacity must be positive"));
        }
        if self.serialize && self.colorize == Some(true) {
            return Err(ConfigurationError::Conflict(
                "serialized output cannot be colorized",
            ));
        }

        let level = self.level.resolve()?;
        let policy = RotationPolicy {
            rotation: self.rotation.map(Setting::resolve).transpose()?,
            retention: self.retention.map(Setting::resolve).transpose()?,
            compression: self.compression.map(Setting::resolve).transpose()?,
        };
        if policy.compression.is_some() && !cfg!(feature = "compression") {
            return Err(ConfigurationError::CompressionFeatureDisabled);
        }

        let colorize = !self.serialize && self.colorize.unwrap_or_else(|| self.destination.is_terminal());
        let parser = match self.markup_max_depth {
            Some(depth) => MarkupParser::with_max_depth(depth),
            None => MarkupParser::new(),
        };
        let renderer = Renderer::new(self.format, parser, colorize, self.serialize)?;

        let name = self.name.unwrap_or_else(|| self.destination.describe());
        let target = match self.destination {
            Destination::Stdout => SinkPlan::Ready(Box::new(StreamSink::stdout())),
            Destination::Stderr => SinkPlan::Ready(Box::new(StreamSink::stderr())),
            Destination::Writer(writer) => SinkPlan::Ready(Box::new(StreamSink::new(writer))),
            Destination::Callable(f) => SinkPlan::Ready(Box::new(CallableSink::new(f))),
            Destination::Sink(sink) => SinkPlan::Ready(sink),
            Destination::File(path) => SinkPlan::File {
                pattern: PathPattern::new(path)?,
                policy,
                utc: self.utc,
                multiprocess: self.multiprocess,
            },
        };
        let queue = self.enqueue.then_some(QueueOptions {
            capacity: self.queue_capacity,
            overflow: self.overflow,
        });

        Ok(Plan {
            name,
            level,
            filter: self.filter,
            renderer,
            catch: self.catch,
            queue,
            on_error: self.on_error,
            target,
        })
    }
}

impl fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("destination", &self.destination)
            .field("name", &self.name)
            .field("level", &self.level)
            .field("filter", &self.filter)
            .field("format", &self.format)
            .field("colorize", &self.colorize)
            .field("serialize", &self.serialize)
            .field("catch", &self.catch)
            .field("enqueue", &self.enqueue)
            .field("queue_capacity", &self.queue_capacity)
            .field("overflow", &self.overflow)
            .field("rotation", &self.rotation)
            .field("retention", &self.retention)
            .field("compression", &self.compression)
            .field("utc", &self.utc)
            .field("multiprocess", &self.multiprocess)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueOptions {
    pub(crate) capacity: Option<usize>,
    pub(crate) overflow: Overflow,
}

pub(crate) enum SinkPlan {
    Ready(Box<dyn Sink>),
    File {
        pattern: PathPattern,
        policy: RotationPolicy,
        utc: bool,
        multiprocess: bool,
    },
}

/// Validated configuration, ready to be started.
pub(crate) struct Plan {
    pub(crate) name: String,
    pub(crate) level: Level,
    pub(crate) filter: Option<Filter>,
    pub(crate) renderer: Renderer,
    pub(crate) catch: bool,
    pub(crate) queue: Option<QueueOptions>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) target: SinkPlan,
}
