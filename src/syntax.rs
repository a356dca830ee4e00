use std::error;
use std::fmt;

use crate::span::Span;

/// A static error (syntax or semantic) found at compile time.
///
/// `notes` lets the compiler attach secondary pointers — e.g. "declared
/// here" alongside the primary `reason` — though most errors carry just one.
#[derive(Debug, PartialEq, Eq)]
pub struct Syntax {
    pub reason: String,
    pub notes: Vec<(Span, Option<String>)>,
}

impl Syntax {
    pub fn error(reason: &str, span: &Span) -> Syntax {
        Syntax { reason: reason.to_string(), notes: vec![(span.clone(), None)] }
    }

    pub fn error_with_note(reason: &str, span: &Span, note: &str) -> Syntax {
        Syntax { reason: reason.to_string(), notes: vec![(span.clone(), Some(note.to_string()))] }
    }
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (span, note) in &self.notes {
            if !span.is_empty() {
                fmt::Display::fmt(span, f)?;
            }
            if let Some(note) = note {
                writeln!(f, "{}", note)?;
            }
        }
        write!(f, "Syntax Error: {}", self.reason)
    }
}

impl error::Error for Syntax {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::Source;
    use std::rc::Rc;

    #[test]
    fn error() {
        let source = Source::source("x = \"Hello, world\" -> y + 1");
        let error = Syntax::error(
            "unexpected token '\"Hello, world!\"'",
            &Span::new(&source, 4, 14),
        );

        let result = format!("{}", error);
        assert!(result.contains("Line 1:5"));
        assert!(result.ends_with("Syntax Error: unexpected token '\"Hello, world!\"'"));
    }
}
