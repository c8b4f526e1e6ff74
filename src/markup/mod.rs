//! Nested color markup: `<red>error <b>here</b></red>`.
//!
//! Tags come from a closed set of style directives. A message is parsed
//! into a tree of [`StyledSpan`]s over its plain text, which is then
//! rendered either with ANSI escape sequences or as plain text.
//!
//! Values interpolated into markup must go through [`escape`] so that
//! `<` and `>` coming from data are never taken for tags.

mod ansi;
mod parser;

use std::borrow::Cow;

pub use self::ansi::strip_ansi;
pub use self::parser::MarkupParser;

use crate::error::MarkupError;
use crate::record::Level;

/// The eight base terminal colors and their bright variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    LightBlack,
    LightRed,
    LightGreen,
    LightYellow,
    LightBlue,
    LightMagenta,
    LightCyan,
    LightWhite,
}

impl Color {
    const NAMES: [(&'static str, Color); 16] = [
        ("black", Color::Black),
        ("red", Color::Red),
        ("green", Color::Green),
        ("yellow", Color::Yellow),
        ("blue", Color::Blue),
        ("magenta", Color::Magenta),
        ("cyan", Color::Cyan),
        ("white", Color::White),
        ("light-black", Color::LightBlack),
        ("light-red", Color::LightRed),
        ("light-green", Color::LightGreen),
        ("light-yellow", Color::LightYellow),
        ("light-blue", Color::LightBlue),
        ("light-magenta", Color::LightMagenta),
        ("light-cyan", Color::LightCyan),
        ("light-white", Color::LightWhite),
    ];

    fn from_name(name: &str) -> Option<Color> {
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, color)| *color)
    }

    /// SGR foreground code.
    fn fg_code(self) -> u8 {
        let index = self as u8;
        if index < 8 {
            30 + index
        } else {
            90 + (index - 8)
        }
    }
}

/// Text attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attr {
    Bold,
    Dim,
    Italic,
    Underline,
    Blink,
    Reverse,
    Hide,
    Strike,
}

impl Attr {
    fn from_name(name: &str) -> Option<Attr> {
        let attr = match name {
            "bold" | "b" => Attr::Bold,
            "dim" | "d" => Attr::Dim,
            "italic" | "i" => Attr::Italic,
            "underline" | "u" => Attr::Underline,
            "blink" | "l" => Attr::Blink,
            "reverse" | "v" => Attr::Reverse,
            "hide" | "h" => Attr::Hide,
            "strike" | "s" => Attr::Strike,
            _ => return None,
        };
        Some(attr)
    }

    fn code(self) -> u8 {
        match self {
            Attr::Bold => 1,
            Attr::Dim => 2,
            Attr::Italic => 3,
            Attr::Underline => 4,
            Attr::Blink => 5,
            Attr::Reverse => 7,
            Attr::Hide => 8,
            Attr::Strike => 9,
        }
    }
}

/// A single supported style directive. Each maps to exactly one escape
/// sequence; combinations are emitted as several sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    Fg(Color),
    Bg(Color),
    Attr(Attr),
}

impl Directive {
    pub fn sgr_code(self) -> u8 {
        match self {
            Directive::Fg(color) => color.fg_code(),
            Directive::Bg(color) => color.fg_code() + 10,
            Directive::Attr(attr) => attr.code(),
        }
    }
}

/// A known tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Style(Directive),
    /// Resolved against the record level at render time.
    Level,
}

impl Tag {
    /// Lowercase color names are foregrounds, uppercase ones backgrounds.
    pub fn lookup(name: &str) -> Option<Tag> {
        if name == "level" {
            return Some(Tag::Level);
        }
        if let Some(attr) = Attr::from_name(name) {
            return Some(Tag::Style(Directive::Attr(attr)));
        }
        if let Some(color) = Color::from_name(name) {
            return Some(Tag::Style(Directive::Fg(color)));
        }
        if name.chars().any(|c| c.is_ascii_lowercase()) {
            return None;
        }
        Color::from_name(&name.to_ascii_lowercase()).map(|color| Tag::Style(Directive::Bg(color)))
    }

    fn directives(self, level: Option<Level>) -> Vec<Directive> {
        match self {
            Tag::Style(directive) => vec![directive],
            Tag::Level => level.map(|l| l.directives().to_vec()).unwrap_or_default(),
        }
    }
}

/// A parsed tag covering `[start, end)` of the plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledSpan {
    pub tag: Tag,
    pub name: String,
    pub start: usize,
    pub end: usize,
    pub children: Vec<StyledSpan>,
}

/// Plain text plus the span tree laid over it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Markup {
    text: String,
    spans: Vec<StyledSpan>,
}

impl Markup {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn spans(&self) -> &[StyledSpan] {
        &self.spans
    }

    /// Deepest nesting in the tree.
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack: Vec<(&StyledSpan, usize)> = self.spans.iter().map(|s| (s, 1)).collect();
        while let Some((span, depth)) = stack.pop() {
            max = max.max(depth);
            stack.extend(span.children.iter().map(|c| (c, depth + 1)));
        }
        max
    }

    /// ANSI-colored when `colorize`, tag-stripped plain text otherwise.
    pub fn render(&self, colorize: bool, level: Option<Level>) -> String {
        if colorize {
            ansi::render(self, level)
        } else {
            self.text.clone()
        }
    }
}

/// Escapes `<`, `>` and `\` so the value renders literally.
pub fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['<', '>', '\\']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        if matches!(c, '<' | '>' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    Cow::Owned(out)
}

/// Parses with the process-wide depth limit and renders in one step.
pub fn render(source: &str, colorize: bool, level: Option<Level>) -> Result<String, MarkupError> {
    Ok(MarkupParser::new().parse(source)?.render(colorize, level))
}
