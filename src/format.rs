//! Record formatting: templates like `{time} | {level: <8} | {message}`
//! are compiled once at registration and turned into markup per record.

use chrono::format::{Item, StrftimeItems};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::{ConfigurationError, DeliveryErrorKind, FormatError};
use crate::markup::{self, MarkupParser};
use crate::record::{value_to_string, Record};

/// Classic colored layout: time, level, location, message.
pub const DEFAULT_FORMAT: &str = "<green>{time:%Y-%m-%d %H:%M:%S%.3f}</green> | \
<level>{level: <8}</level> | \
<cyan>{name}</cyan>:<cyan>{function}</cyan>:<cyan>{line}</cyan> - \
<level>{message}</level>";

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

/// User formatting function. Its output is raw markup.
pub type FormatFn = Arc<dyn Fn(&Record) -> String + Send + Sync>;

/// How a handler turns a record into text.
#[derive(Clone)]
pub enum Format {
    Template(String),
    Function(FormatFn),
}

impl Default for Format {
    fn default() -> Self {
        Format::Template(DEFAULT_FORMAT.to_string())
    }
}

impl fmt::Debug for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Template(t) => f.debug_tuple("Template").field(t).finish(),
            Format::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl From<&str> for Format {
    fn from(template: &str) -> Self {
        Format::Template(template.to_string())
    }
}

impl From<String> for Format {
    fn from(template: String) -> Self {
        Format::Template(template)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Time(Option<String>),
    Level,
    LevelNo,
    Message,
    Name,
    Function,
    File,
    Line,
    Process,
    Thread,
    Exception,
    ExtraAll,
    Extra(String),
}

impl Field {
    fn parse(name: &str, spec: Option<&str>) -> Result<Field, ConfigurationError> {
        let field = match name {
            "time" => {
                if let Some(spec) = spec {
                    if StrftimeItems::new(spec).any(|item| matches!(item, Item::Error)) {
                        return Err(ConfigurationError::InvalidFormat(format!(
                            "invalid time format {spec:?}"
                        )));
                    }
                }
                return Ok(Field::Time(spec.map(str::to_string)));
            }
            "level" => Field::Level,
            "level.no" => Field::LevelNo,
            "message" => Field::Message,
            "name" | "module" => Field::Name,
            "function" => Field::Function,
            "file" => Field::File,
            "line" => Field::Line,
            "process" => Field::Process,
            "thread" => Field::Thread,
            "exception" => Field::Exception,
            "extra" => Field::ExtraAll,
            other => match other.strip_prefix("extra[").and_then(|k| k.strip_suffix(']')) {
                Some(key) if !key.is_empty() => Field::Extra(key.to_string()),
                _ => {
                    return Err(ConfigurationError::InvalidFormat(format!(
                        "unknown field {{{other}}}"
                    )))
                }
            },
        };
        Ok(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Align {
    fill: char,
    kind: char,
    width: usize,
}

impl Align {
    fn parse(spec: &str) -> Result<Align, ConfigurationError> {
        let invalid = || ConfigurationError::InvalidFormat(format!("invalid alignment {spec:?}"));
        let mut chars = spec.chars();
        let first = chars.next().ok_or_else(invalid)?;
        let second = chars.clone().next();
        let (fill, kind, rest) = match second {
            Some(k @ ('<' | '>' | '^')) => {
                chars.next();
                (first, k, chars.as_str())
            }
            _ if matches!(first, '<' | '>' | '^') => (' ', first, chars.as_str()),
            _ => return Err(invalid()),
        };
        let width = rest.parse::<usize>().map_err(|_| invalid())?;
        Ok(Align { fill, kind, width })
    }

    fn apply(&self, value: &str) -> String {
        let len = value.chars().count();
        if len >= self.width {
            return value.to_string();
        }
        let pad = self.width - len;
        let (left, right) = match self.kind {
            '<' => (0, pad),
            '>' => (pad, 0),
            _ => (pad / 2, pad - pad / 2),
        };
        let mut out = String::with_capacity(value.len() + pad);
        out.extend(std::iter::repeat(self.fill).take(left));
        out.push_str(value);
        out.extend(std::iter::repeat(self.fill).take(right));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { field: Field, align: Option<Align> },
}

/// A compiled format template.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
    has_exception: bool,
}

impl Template {
    pub fn compile(source: &str) -> Result<Template, ConfigurationError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(ConfigurationError::InvalidFormat(format!(
                        "unbalanced '}}' at offset {pos}"
                    )))
                }
                '{' => {
                    let mut inner = String::new();
                    let mut closed = false;
                    for (_, k) in chars.by_ref() {
                        if k == '}' {
                            closed = true;
                            break;
                        }
                        inner.push(k);
                    }
                    if !closed {
                        return Err(ConfigurationError::InvalidFormat(format!(
                            "unclosed '{{' at offset {pos}"
                        )));
                    }
                    let (name, spec) = match inner.split_once(':') {
                        Some((name, spec)) => (name.trim(), Some(spec)),
                        None => (inner.trim(), None),
                    };
                    let field = Field::parse(name, spec)?;
                    let align = match (&field, spec) {
                        (Field::Time(_), _) | (_, None) => None,
                        (_, Some(spec)) => Some(Align::parse(spec)?),
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field { field, align });
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let has_exception = segments.iter().any(|s| {
            matches!(
                s,
                Segment::Field {
                    field: Field::Exception,
                    ..
                }
            )
        });
        Ok(Template {
            segments,
            has_exception,
        })
    }

    /// The literal parts only, used to validate the template's own markup.
    fn skeleton(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Literal(l) => Some(l.as_str()),
                Segment::Field { .. } => None,
            })
            .collect()
    }

    /// Markup source for one record, newline-terminated.
    pub fn format(&self, record: &Record) -> Result<String, FormatError> {
        let mut out = String::with_capacity(128);
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => out.push_str(literal),
                // markup messages are not padded, their visible width is unknown
                Segment::Field {
                    field: Field::Message,
                    ..
                } if record.markup => out.push_str(&record.markup_message()?),
                Segment::Field { field, align } => {
                    let value = field_value(field, record)?;
                    let value = match align {
                        Some(align) => align.apply(&value),
                        None => value,
                    };
                    out.push_str(&markup::escape(&value));
                }
            }
        }
        out.push('\n');
        if let (Some(exception), false) = (&record.exception, self.has_exception) {
            out.push_str(&markup::escape(&exception.to_string()));
            out.push('\n');
        }
        Ok(out)
    }
}

fn field_value(field: &Field, record: &Record) -> Result<String, FormatError> {
    let location = record.location.as_ref();
    let value = match field {
        Field::Time(spec) => record
            .time
            .format(spec.as_deref().unwrap_or(DEFAULT_TIME_FORMAT))
            .to_string(),
        Field::Level => record.level.as_str().to_string(),
        Field::LevelNo => record.level.severity().to_string(),
        Field::Message => record.message.clone(),
        Field::Name => location.map(|l| l.name.clone()).unwrap_or_default(),
        Field::Function => location.map(|l| l.function.clone()).unwrap_or_default(),
        Field::File => location.map(|l| l.file.clone()).unwrap_or_default(),
        Field::Line => location.map(|l| l.line.to_string()).unwrap_or_default(),
        Field::Process => record.process.id.to_string(),
        Field::Thread => record
            .thread
            .name
            .clone()
            .unwrap_or_else(|| record.thread.id.clone()),
        Field::Exception => record
            .exception
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default(),
        Field::ExtraAll => serde_json::Value::Object(record.extra.resolve().into_iter().collect()).to_string(),
        Field::Extra(key) => record
            .extra
            .get(key)
            .map(value_to_string)
            .ok_or_else(|| FormatError::MissingExtra { key: key.clone() })?,
    };
    Ok(value)
}

enum Compiled {
    Template(Template),
    Function(FormatFn),
}

#[derive(Serialize)]
struct Serialized<'a> {
    text: &'a str,
    record: &'a Record,
}

/// Per-handler rendering: format, markup, colors, optional JSON.
pub(crate) struct Renderer {
    format: Compiled,
    parser: MarkupParser,
    colorize: bool,
    serialize: bool,
}

impl Renderer {
    pub(crate) fn new(
        format: Format,
        parser: MarkupParser,
        colorize: bool,
        serialize: bool,
    ) -> Result<Self, ConfigurationError> {
        let format = match format {
            Format::Template(source) => {
                let template = Template::compile(&source)?;
                parser.parse(&template.skeleton())?;
                Compiled::Template(template)
            }
            Format::Function(f) => Compiled::Function(f),
        };
        Ok(Self {
            format,
            parser,
            colorize,
            serialize,
        })
    }

    pub(crate) fn render(&self, record: &Record) -> Result<String, DeliveryErrorKind> {
        let source = match &self.format {
            Compiled::Template(template) => template.format(record)?,
            Compiled::Function(f) => f(record),
        };
        let text = self
            .parser
            .parse(&source)?
            .render(self.colorize, Some(record.level));
        if !self.serialize {
            return Ok(text);
        }
        let mut line = serde_json::to_string(&Serialized {
            text: &text,
            record,
        })?;
        line.push('\n');
        Ok(line)
    }
}
