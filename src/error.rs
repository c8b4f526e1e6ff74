//! Error types for every stage of the pipeline.
//!
//! Configuration errors surface from [`Dispatcher::register`] before any
//! resource is allocated. Everything else happens while a record is being
//! delivered and is wrapped into a [`DeliveryError`] carrying the unit id.
//!
//! [`Dispatcher::register`]: crate::dispatcher::Dispatcher::register

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Boxed error returned by user callables.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Rejected handler registration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("unknown rotation setting: {0:?}")]
    UnknownRotation(String),

    #[error("unknown retention setting: {0:?}")]
    UnknownRetention(String),

    #[error("unknown compression format: {0:?}")]
    UnknownCompression(String),

    #[error("unknown level: {0:?}")]
    UnknownLevel(String),

    #[error("conflicting options: {0}")]
    Conflict(&'static str),

    #[error("invalid format template: {0}")]
    InvalidFormat(String),

    #[error("invalid markup in format template: {0}")]
    Markup(#[from] MarkupError),

    #[error("compression requires the `compression` feature")]
    CompressionFeatureDisabled,

    #[error("cannot open log file {path}: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Message template and substitution values do not line up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("no value for positional argument {index}")]
    MissingArgument { index: usize },

    #[error("no value for named argument {name:?}")]
    MissingNamed { name: String },

    #[error("cannot mix automatic and manual argument numbering")]
    MixedNumbering,

    #[error("unbalanced brace at offset {position}")]
    UnbalancedBrace { position: usize },

    #[error("record has no extra value for key {key:?}")]
    MissingExtra { key: String },
}

/// Markup that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkupError {
    #[error("unknown tag <{tag}> at offset {position}")]
    UnknownTag { tag: String, position: usize },

    #[error("closing tag </{tag}> at offset {position} has no matching opening tag")]
    UnmatchedClosingTag { tag: String, position: usize },

    #[error("opening tag <{tag}> at offset {position} is never closed")]
    UnclosedTag { tag: String, position: usize },

    #[error("markup nesting exceeds the maximum depth of {max_depth} at offset {position}")]
    RecursionLimitExceeded { max_depth: usize, position: usize },
}

/// Physical operation that failed on a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOp {
    Open,
    Write,
    Flush,
    Rotate,
    Compress,
    Delete,
    Lock,
}

impl fmt::Display for SinkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkOp::Open => "open",
            SinkOp::Write => "write",
            SinkOp::Flush => "flush",
            SinkOp::Rotate => "rotate",
            SinkOp::Compress => "compress",
            SinkOp::Delete => "delete",
            SinkOp::Lock => "lock",
        };
        f.write_str(name)
    }
}

/// Failure of the physical sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{op} failed on {path}: {source}")]
    File {
        op: SinkOp,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed: {source}")]
    Stream {
        op: SinkOp,
        #[source]
        source: io::Error,
    },

    #[error("callable sink failed: {0}")]
    Callable(BoxError),
}

impl SinkError {
    pub(crate) fn file(op: SinkOp, path: impl Into<PathBuf>, source: io::Error) -> Self {
        SinkError::File {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn stream(op: SinkOp, source: io::Error) -> Self {
        SinkError::Stream { op, source }
    }
}

/// What went wrong while delivering a record.
#[derive(Debug, Error)]
pub enum DeliveryErrorKind {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Markup(#[from] MarkupError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("cannot serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("record logged from inside this handler's own sink")]
    Reentrant,
}

/// Record-time failure of one handler.
#[derive(Debug, Error)]
#[error("handler #{handler_id} ({handler_name}): {kind}")]
pub struct DeliveryError {
    pub handler_id: usize,
    pub handler_name: String,
    pub kind: DeliveryErrorKind,
}

impl DeliveryError {
    pub(crate) fn new(handler_id: usize, handler_name: &str, kind: impl Into<DeliveryErrorKind>) -> Self {
        Self {
            handler_id,
            handler_name: handler_name.to_string(),
            kind: kind.into(),
        }
    }
}
