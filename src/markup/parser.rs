use crate::env;
use crate::error::MarkupError;

use super::{Markup, StyledSpan, Tag};

/// Stack-based markup parser with a bounded nesting depth.
#[derive(Debug, Clone, Copy)]
pub struct MarkupParser {
    max_depth: usize,
}

impl Default for MarkupParser {
    fn default() -> Self {
        Self::new()
    }
}

struct OpenSpan {
    tag: Tag,
    name: String,
    start: usize,
    position: usize,
    children: Vec<StyledSpan>,
}

impl MarkupParser {
    /// Parser using the depth read from `LOG_PIPELINE_MARKUP_MAX_DEPTH`.
    pub fn new() -> Self {
        Self::with_max_depth(env::markup_max_depth())
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn parse(&self, source: &str) -> Result<Markup, MarkupError> {
        let mut text = String::with_capacity(source.len());
        let mut roots = Vec::new();
        let mut stack: Vec<OpenSpan> = Vec::new();
        let bytes = source.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'\\' if matches!(bytes.get(i + 1), Some(b'<' | b'>' | b'\\')) => {
                    text.push(bytes[i + 1] as char);
                    i += 2;
                }
                b'<' => match scan_tag(source, i) {
                    Some((name, closing, end)) => {
                        if closing {
                            self.close(&mut stack, &mut roots, name, i, text.len())?;
                        } else {
                            let tag = Tag::lookup(name).ok_or_else(|| MarkupError::UnknownTag {
                                tag: name.to_string(),
                                position: i,
                            })?;
                            if stack.len() >= self.max_depth {
                                return Err(MarkupError::RecursionLimitExceeded {
                                    max_depth: self.max_depth,
                                    position: i,
                                });
                            }
                            stack.push(OpenSpan {
                                tag,
                                name: name.to_string(),
                                start: text.len(),
                                position: i,
                                children: Vec::new(),
                            });
                        }
                        i = end;
                    }
                    None => {
                        text.push('<');
                        i += 1;
                    }
                },
                _ => {
                    // `i` always sits on a char boundary here
                    let c = source[i..].chars().next().unwrap_or_default();
                    text.push(c);
                    i += c.len_utf8().max(1);
                }
            }
        }

        if let Some(open) = stack.pop() {
            return Err(MarkupError::UnclosedTag {
                tag: open.name,
                position: open.position,
            });
        }

        Ok(Markup { text, spans: roots })
    }

    fn close(
        &self,
        stack: &mut Vec<OpenSpan>,
        roots: &mut Vec<StyledSpan>,
        name: &str,
        position: usize,
        end: usize,
    ) -> Result<(), MarkupError> {
        let matches_top = stack
            .last()
            .map(|open| name.is_empty() || open.name == name)
            .unwrap_or(false);
        if !matches_top {
            return Err(MarkupError::UnmatchedClosingTag {
                tag: name.to_string(),
                position,
            });
        }
        let Some(open) = stack.pop() else {
            return Ok(());
        };
        let span = StyledSpan {
            tag: open.tag,
            name: open.name,
            start: open.start,
            end,
            children: open.children,
        };
        match stack.last_mut() {
            Some(parent) => parent.children.push(span),
            None => roots.push(span),
        }
        Ok(())
    }
}

/// Recognizes `<name>`, `</name>` and `</>` starting at `at`.
/// Returns the name, whether it closes, and the offset past `>`.
fn scan_tag(source: &str, at: usize) -> Option<(&str, bool, usize)> {
    let bytes = source.as_bytes();
    let mut j = at + 1;
    let closing = bytes.get(j) == Some(&b'/');
    if closing {
        j += 1;
    }
    let name_start = j;
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'-' || bytes[j] == b'_') {
        j += 1;
    }
    if bytes.get(j) != Some(&b'>') {
        return None;
    }
    if name_start == j && !closing {
        return None;
    }
    Some((&source[name_start..j], closing, j + 1))
}
