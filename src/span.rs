use std::fmt::{Formatter, Display, Result};
use std::usize;
use std::rc::Rc;

use crate::source::Source;

/// A `Span` refers to a section of a `Source`, much like a `&str`, but
/// addressed by offset and length rather than by borrowing the text itself.
/// Spans are paired with tokens, AST-free compiler bookkeeping, and errors.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Span {
    source: Option<Rc<Source>>,
    offset: usize,
    length: usize,
}

impl Span {
    pub fn new(source: &Rc<Source>, offset: usize, length: usize) -> Span {
        Span { source: Some(Rc::clone(source)), offset, length }
    }

    /// A `Span` that points at a single point in the source.
    pub fn point(source: &Rc<Source>, offset: usize) -> Span {
        Span { source: Some(Rc::clone(source)), offset, length: 1 }
    }

    /// An empty `Span`, with no source. Combining it with any other span
    /// just yields the other span.
    pub fn empty() -> Span {
        Span { source: None, offset: 0, length: usize::MAX }
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_none()
    }

    /// Creates a new `Span` which spans the space of the previous two.
    pub fn combine(a: &Span, b: &Span) -> Span {
        if a.is_empty() { return b.clone(); }
        if b.is_empty() { return a.clone(); }

        if a.source != b.source {
            panic!("can't combine two spans with separate sources")
        }

        let offset = a.offset.min(b.offset);
        let end = (a.offset + a.length).max(b.offset + b.length);
        let length = end - offset;

        Span::new(a.source.as_ref().unwrap(), offset, length)
    }

    /// Combines a set of `Span`s (a fold-left over `Span::combine`).
    pub fn join(mut spans: Vec<Span>) -> Span {
        let mut combined = match spans.pop() {
            Some(span) => span,
            None => return Span::empty(),
        };

        while let Some(span) = spans.pop() {
            combined = Span::combine(&combined, &span);
        }

        combined
    }

    /// Returns the textual contents of a `Span`. Panics if the span is
    /// empty or straddles an invalid byte boundary.
    pub fn contents(&self) -> String {
        if self.is_empty() { panic!("an empty span does not have any contents") }
        let source = self.source.as_ref().unwrap();
        source.contents[self.offset..(self.offset + self.length)].to_string()
    }

    pub fn line(&self) -> usize {
        if self.is_empty() { panic!("an empty span has no line number") }
        let source = self.source.as_ref().unwrap();
        source.contents[..=self.offset.min(source.contents.len().saturating_sub(1))]
            .lines()
            .count()
            .max(1)
    }

    fn line_indices(&self) -> Option<((usize, usize), (usize, usize))> {
        if self.is_empty() { panic!("can not return the line indices of an empty span") }

        let source = self.source.as_ref().unwrap();
        let start = self.offset;
        let end = self.offset + self.length;

        let start_lines: Vec<&str> = source.contents[..=start.min(source.contents.len() - 1)].lines().collect();
        let end_lines: Vec<&str> = source.contents[..=end.min(source.contents.len() - 1)].lines().collect();

        let start_line = start_lines.len().saturating_sub(1);
        let end_line = end_lines.len().saturating_sub(1);

        let start_col = start_lines.last()?.len().saturating_sub(1);
        let end_col = end_lines.last()?.len().saturating_sub(1);

        Some(((start_line, start_col), (end_line, end_col)))
    }
}

impl Display for Span {
    /// Renders where a `Span` occurs in its source:
    /// ```plain
    /// Line 12:5
    ///    |
    /// 12 | x = blatant { error }
    ///    |     ^^^^^^^^^^^^^^^^
    /// ```
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        if self.is_empty() {
            return write!(f, "<no location>");
        }

        let source = self.source.as_ref().unwrap();
        let lines: Vec<&str> = source.contents.lines().collect();
        let ((start_line, start_col), (end_line, _end_col)) = match self.line_indices() {
            Some(li) => li,
            None => return write!(f, "<no location>"),
        };

        let readable_start_line = (start_line + 1).to_string();
        let readable_end_line = (end_line + 1).to_string();
        let padding = readable_end_line.len();

        let location = format!("Line {}:{}", readable_start_line, start_col + 1);
        let separator = format!("{} |", " ".repeat(padding));

        writeln!(f, "{}", location)?;
        writeln!(f, "{}", separator)?;

        if start_line == end_line {
            let l = lines.get(end_line).copied().unwrap_or("");
            let line = format!("{} | {}", readable_end_line, l);
            let underline = format!(
                "{} | {}{}",
                " ".repeat(padding),
                " ".repeat(start_col),
                "^".repeat(self.length.max(1)),
            );
            writeln!(f, "{}", line)?;
            writeln!(f, "{}", underline)
        } else {
            let formatted = lines[start_line..=end_line.min(lines.len().saturating_sub(1))]
                .iter()
                .enumerate()
                .map(|(i, l)| {
                    let readable_line_no = (start_line + i + 1).to_string();
                    let partial_padding = " ".repeat(padding.saturating_sub(readable_line_no.len()));
                    format!("{}{} > {}", partial_padding, readable_line_no, l)
                })
                .collect::<Vec<String>>()
                .join("\n");

            writeln!(f, "{}", formatted)?;
            writeln!(f, "{}", separator)
        }
    }
}

/// A wrapper pairing some item (a token, a property, an opcode emission)
/// with the `Span` it was parsed from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Spanned<T> {
    pub item: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(item: T, span: Span) -> Spanned<T> {
        Spanned { item, span }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn combination() {
        let source = Rc::new(Source { name: Rc::from("t"), contents: Rc::from("heck, that's awesome") });
        let a = Span::new(&source, 0, 5);
        let b = Span::new(&source, 11, 2);

        assert_eq!(Span::combine(&a, &b), Span::new(&source, 0, 13));
    }

    #[test]
    fn span_and_contents() {
        let source = Rc::new(Source { name: Rc::from("t"), contents: Rc::from("hello, this is some text!") });
        let spans = vec![
            Span::new(&source, 0, 8),
            Span::new(&source, 7, 5),
            Span::new(&source, 12, 4),
        ];
        let result = Span::new(&source, 0, 16);

        assert_eq!(Span::join(spans).contents(), result.contents());
    }
}
