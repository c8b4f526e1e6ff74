use crate::record::Level;

use super::{Directive, Markup, StyledSpan};

const RESET: &str = "\x1b[0m";

enum Event<'a> {
    Open(&'a StyledSpan),
    Close,
}

/// Flattens the span tree into offset-ordered open/close events without
/// recursing, so deep trees cannot exhaust the call stack.
fn events(markup: &Markup) -> Vec<(usize, Event<'_>)> {
    let mut out = Vec::new();
    for root in &markup.spans {
        out.push((root.start, Event::Open(root)));
        let mut stack: Vec<(&StyledSpan, usize)> = vec![(root, 0)];
        while let Some(top) = stack.last_mut() {
            let (span, next) = (top.0, top.1);
            if let Some(child) = span.children.get(next) {
                top.1 += 1;
                out.push((child.start, Event::Open(child)));
                stack.push((child, 0));
            } else {
                out.push((span.end, Event::Close));
                stack.pop();
            }
        }
    }
    out
}

fn push_sgr(out: &mut String, directive: Directive) {
    out.push_str("\x1b[");
    out.push_str(&directive.sgr_code().to_string());
    out.push('m');
}

/// Emits one escape sequence per directive. Closing a span resets and
/// re-applies every ancestor, so inner tags never cancel outer ones.
pub(super) fn render(markup: &Markup, level: Option<Level>) -> String {
    let text = markup.text.as_str();
    let mut out = String::with_capacity(text.len() * 2);
    let mut active: Vec<Vec<Directive>> = Vec::new();
    let mut pos = 0;

    for (offset, event) in events(markup) {
        out.push_str(&text[pos..offset]);
        pos = offset;
        match event {
            Event::Open(span) => {
                let directives = span.tag.directives(level);
                for directive in &directives {
                    push_sgr(&mut out, *directive);
                }
                active.push(directives);
            }
            Event::Close => {
                let closed = active.pop().unwrap_or_default();
                if closed.is_empty() {
                    continue;
                }
                out.push_str(RESET);
                for directive in active.iter().flatten() {
                    push_sgr(&mut out, *directive);
                }
            }
        }
    }
    out.push_str(&text[pos..]);
    out
}

/// Removes SGR escape sequences.
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for k in chars.by_ref() {
                if k.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::MarkupParser;
    use proptest::prelude::*;

    fn colorize(source: &str, level: Option<Level>) -> String {
        MarkupParser::with_max_depth(32)
            .parse(source)
            .unwrap()
            .render(true, level)
    }

    #[test]
    fn each_directive_is_its_own_sequence() {
        assert_eq!(colorize("<red>x</red>", None), "\x1b[31mx\x1b[0m");
        assert_eq!(
            colorize("<level>warn</level>", Some(Level::Warning)),
            "\x1b[33m\x1b[1mwarn\x1b[0m"
        );
    }

    #[test]
    fn closing_inner_tag_restores_ancestors() {
        assert_eq!(
            colorize("<b>a<red>b</red>c</b>", None),
            "\x1b[1ma\x1b[31mb\x1b[0m\x1b[1mc\x1b[0m"
        );
    }

    #[test]
    fn inner_color_overrides_outer_color_but_keeps_attributes() {
        let out = colorize("<u><green>a<blue>b</blue>c</green></u>", None);
        assert_eq!(
            out,
            "\x1b[4m\x1b[32ma\x1b[34mb\x1b[0m\x1b[4m\x1b[32mc\x1b[0m\x1b[4m\x1b[0m"
        );
    }

    #[test]
    fn level_tag_without_level_emits_nothing() {
        assert_eq!(colorize("<level>x</level>y", None), "xy");
    }

    #[test]
    fn strip_ansi_removes_sequences() {
        assert_eq!(strip_ansi("\x1b[1m\x1b[31mhi\x1b[0m there"), "hi there");
    }

    fn tag_name() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec!["red", "b", "u", "GREEN", "light-cyan", "level", "dim"])
    }

    fn well_nested(depth: u32) -> BoxedStrategy<String> {
        let leaf = "[a-z <>\\\\-]{0,8}".prop_map(|s| crate::markup::escape(&s).into_owned());
        leaf.prop_recursive(depth, 32, 4, |inner| {
            prop_oneof![
                (tag_name(), inner.clone()).prop_map(|(t, body)| format!("<{t}>{body}</{t}>")),
                prop::collection::vec(inner, 1..4).prop_map(|parts| parts.concat()),
            ]
        })
        .boxed()
    }

    proptest! {
        #[test]
        fn rendering_then_stripping_reproduces_plain_text(source in well_nested(6)) {
            let markup = MarkupParser::with_max_depth(64).parse(&source).unwrap();
            let colored = markup.render(true, Some(Level::Error));
            prop_assert_eq!(strip_ansi(&colored), markup.render(false, None));
        }
    }
}
