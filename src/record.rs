use chrono::{DateTime, FixedOffset, Local};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use crate::error::{ConfigurationError, FormatError};
use crate::markup::{self, Attr, Color, Directive};

/// Severity of a record. Ordered by severity number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub const ALL: [Level; 7] = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Success,
        Level::Warning,
        Level::Error,
        Level::Critical,
    ];

    pub fn severity(self) -> u32 {
        match self {
            Level::Trace => 5,
            Level::Debug => 10,
            Level::Info => 20,
            Level::Success => 25,
            Level::Warning => 30,
            Level::Error => 40,
            Level::Critical => 50,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Success => "SUCCESS",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    /// Directives applied by the `<level>` markup tag.
    pub fn directives(self) -> &'static [Directive] {
        match self {
            Level::Trace => &[Directive::Fg(Color::Cyan), Directive::Attr(Attr::Bold)],
            Level::Debug => &[Directive::Fg(Color::Blue), Directive::Attr(Attr::Bold)],
            Level::Info => &[Directive::Attr(Attr::Bold)],
            Level::Success => &[Directive::Fg(Color::Green), Directive::Attr(Attr::Bold)],
            Level::Warning => &[Directive::Fg(Color::Yellow), Directive::Attr(Attr::Bold)],
            Level::Error => &[Directive::Fg(Color::Red), Directive::Attr(Attr::Bold)],
            Level::Critical => &[Directive::Bg(Color::Red), Directive::Attr(Attr::Bold)],
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `pad` so that `{:<8}` alignment works on levels
        f.pad(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "WARN" => return Ok(Level::Warning),
            "FATAL" => return Ok(Level::Critical),
            _ => {}
        }
        Level::ALL
            .into_iter()
            .find(|level| level.as_str() == upper)
            .ok_or_else(|| ConfigurationError::UnknownLevel(s.to_string()))
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warning,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Immutable stack of key/value layers. Later layers shadow earlier ones.
#[derive(Debug, Clone, Default)]
pub struct Extra {
    layers: Vec<Arc<BTreeMap<String, serde_json::Value>>>,
}

impl Extra {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new mapping with `layer` stacked on top.
    pub fn with_layer(&self, layer: impl Into<Arc<BTreeMap<String, serde_json::Value>>>) -> Self {
        let layer = layer.into();
        let mut layers = self.layers.clone();
        if !layer.is_empty() {
            layers.push(layer);
        }
        Extra { layers }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.layers.iter().rev().find_map(|layer| layer.get(key))
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|layer| layer.is_empty())
    }

    /// Flattens the layers, rightmost wins.
    pub fn resolve(&self) -> BTreeMap<String, serde_json::Value> {
        let mut merged = BTreeMap::new();
        for layer in &self.layers {
            for (key, value) in layer.iter() {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

impl Serialize for Extra {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let merged = self.resolve();
        let mut map = serializer.serialize_map(Some(merged.len()))?;
        for (key, value) in &merged {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Description of an error attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
    pub kind: String,
    pub message: String,
    pub traceback: Option<String>,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Builds a description from a Rust error and its source chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        let kind = format!("{err:?}")
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .next()
            .unwrap_or_default()
            .to_string();
        let info = ExceptionInfo::new(kind, err.to_string());
        if chain.is_empty() {
            info
        } else {
            info.with_traceback(chain.join("\n"))
        }
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(traceback) = &self.traceback {
            writeln!(f, "{traceback}")?;
        }
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Where the record was emitted from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    /// Module path, used by filters.
    pub name: String,
    pub function: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub id: u32,
    pub name: String,
}

impl ProcessInfo {
    fn current() -> Self {
        static NAME: OnceLock<String> = OnceLock::new();
        let name = NAME.get_or_init(|| {
            std::env::current_exe()
                .ok()
                .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .unwrap_or_default()
        });
        Self {
            id: std::process::id(),
            name: name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub id: String,
    pub name: Option<String>,
}

impl ThreadInfo {
    fn current() -> Self {
        let thread = std::thread::current();
        let id = format!("{:?}", thread.id())
            .trim_start_matches("ThreadId(")
            .trim_end_matches(')')
            .to_string();
        Self {
            id,
            name: thread.name().map(str::to_string),
        }
    }
}

/// One log event. Built once, then shared read-only by every handler.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub level: Level,
    #[serde(skip)]
    pub message_template: String,
    pub message: String,
    #[serde(skip)]
    pub args: Vec<String>,
    #[serde(skip)]
    pub named: BTreeMap<String, String>,
    /// The message template carries markup of its own.
    #[serde(skip)]
    pub markup: bool,
    pub time: DateTime<FixedOffset>,
    pub process: ProcessInfo,
    pub thread: ThreadInfo,
    pub exception: Option<ExceptionInfo>,
    pub location: Option<SourceLocation>,
    pub extra: Extra,
}

impl Record {
    pub fn builder(level: Level, template: impl Into<String>) -> RecordBuilder {
        RecordBuilder::new(level, template)
    }

    /// Message as markup source: substituted values are escaped, the
    /// template itself is kept raw only when the record opted in.
    pub(crate) fn markup_message(&self) -> Result<Cow<'_, str>, FormatError> {
        if !self.markup {
            return Ok(markup::escape(&self.message));
        }
        substitute(&self.message_template, &self.args, &self.named, markup::escape).map(Cow::Owned)
    }

    pub(crate) fn module(&self) -> &str {
        self.location.as_ref().map(|l| l.name.as_str()).unwrap_or("")
    }
}

/// Builder resolving the message template against its values.
#[derive(Debug)]
pub struct RecordBuilder {
    level: Level,
    template: String,
    args: Vec<String>,
    named: BTreeMap<String, serde_json::Value>,
    markup: bool,
    time: Option<DateTime<FixedOffset>>,
    exception: Option<ExceptionInfo>,
    location: Option<SourceLocation>,
    extra: Extra,
}

impl RecordBuilder {
    fn new(level: Level, template: impl Into<String>) -> Self {
        Self {
            level,
            template: template.into(),
            args: Vec::new(),
            named: BTreeMap::new(),
            markup: false,
            time: None,
            exception: None,
            location: None,
            extra: Extra::new(),
        }
    }

    /// Positional value for `{}` / `{N}`.
    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    /// Named value for `{name}`; also visible in the per-call extra layer.
    pub fn named(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    pub fn markup(mut self, enabled: bool) -> Self {
        self.markup = enabled;
        self
    }

    pub fn time(mut self, time: DateTime<FixedOffset>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Base/bound layers shared with other records.
    pub fn extra(mut self, extra: Extra) -> Self {
        self.extra = extra;
        self
    }

    pub fn build(self) -> Result<Record, FormatError> {
        let named: BTreeMap<String, String> = self
            .named
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect();
        let message = substitute(&self.template, &self.args, &named, Cow::Borrowed)?;
        let extra = self.extra.with_layer(self.named);

        Ok(Record {
            level: self.level,
            message_template: self.template,
            message,
            args: self.args,
            named,
            markup: self.markup,
            time: self.time.unwrap_or_else(|| Local::now().fixed_offset()),
            process: ProcessInfo::current(),
            thread: ThreadInfo::current(),
            exception: self.exception,
            location: self.location,
            extra,
        })
    }
}

pub(crate) fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replaces `{}`, `{N}` and `{name}` placeholders. `{{` and `}}` are
/// literal braces.
fn substitute<'v, F>(
    template: &str,
    args: &'v [String],
    named: &'v BTreeMap<String, String>,
    render: F,
) -> Result<String, FormatError>
where
    F: Fn(&'v str) -> Cow<'v, str>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    let mut next_auto = 0usize;
    let mut manual = false;

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(FormatError::UnbalancedBrace { position: pos }),
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for (_, k) in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if !closed {
                    return Err(FormatError::UnbalancedBrace { position: pos });
                }
                let value = if key.is_empty() {
                    if manual {
                        return Err(FormatError::MixedNumbering);
                    }
                    let index = next_auto;
                    next_auto += 1;
                    args.get(index)
                        .ok_or(FormatError::MissingArgument { index })?
                } else if let Ok(index) = key.parse::<usize>() {
                    if next_auto > 0 {
                        return Err(FormatError::MixedNumbering);
                    }
                    manual = true;
                    args.get(index)
                        .ok_or(FormatError::MissingArgument { index })?
                } else {
                    named
                        .get(&key)
                        .ok_or(FormatError::MissingNamed { name: key })?
                };
                out.push_str(&render(value));
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
