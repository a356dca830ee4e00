use std::fmt;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// The full text of a program being compiled, plus a name used in diagnostics.
///
/// Cheaply cloneable: the contents are shared via `Rc` so every `Span` can
/// carry its own reference to the source it points into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: Rc<str>,
    pub contents: Rc<str>,
}

impl Source {
    pub fn source(contents: &str) -> Rc<Source> {
        Rc::new(Source {
            name: Rc::from("source"),
            contents: Rc::from(contents),
        })
    }

    pub fn path<P: AsRef<Path>>(path: P) -> Result<Rc<Source>, std::io::Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        Ok(Rc::new(Source {
            name: Rc::from(path.to_string_lossy().as_ref()),
            contents: Rc::from(contents.as_str()),
        }))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
