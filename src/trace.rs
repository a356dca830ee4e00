use std::error;
use std::fmt;

use crate::span::Span;

/// A runtime error: a traceback from the point of failure out through every
/// enclosing call frame, innermost first.
#[derive(Debug, PartialEq, Eq)]
pub struct Trace {
    pub kind: String,
    pub message: String,
    pub frames: Vec<(Span, String)>,
}

impl Trace {
    pub fn error(kind: &str, message: &str, frames: Vec<(Span, String)>) -> Trace {
        Trace {
            kind: kind.to_string(),
            message: message.to_string(),
            frames,
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Traceback, most recent call last:")?;

        for (span, name) in &self.frames {
            if !span.is_empty() {
                fmt::Display::fmt(span, f)?;
            }
            writeln!(f, "in {}", name)?;
        }

        writeln!(f, "Runtime {}: {}", self.kind, self.message)
    }
}

impl error::Error for Trace {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::Source;

    #[test]
    fn traceback() {
        let source = Source::source("fn a(){ b(); }\nfn b(){ oops(); }\n");

        let trace = Trace::error(
            "Type Error",
            "can't add Number to Nil",
            vec![
                (Span::new(&source, 9, 5), "a".to_string()),
                (Span::new(&source, 24, 6), "script".to_string()),
            ],
        );

        let result = format!("{}", trace);
        assert!(result.starts_with("Traceback, most recent call last:\n"));
        assert!(result.contains("in a\n"));
        assert!(result.ends_with("Runtime Type Error: can't add Number to Nil\n"));
    }
}
