//! Source locations attached to syntax, entities and errors.

use std::fmt;
use std::sync::Arc;

/// Position of a node in its source file.
///
/// `start` / `end` are byte offsets; `line` / `column` are 1-based and
/// point at `start`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: Arc<str>,
    pub line: u32,
    pub column: u32,
    pub start: u32,
    pub end: u32,
}

impl SourceLocation {
    pub fn new(file: Arc<str>, line: u32, column: u32, start: u32, end: u32) -> Self {
        SourceLocation {
            file,
            line,
            column,
            start,
            end,
        }
    }

    /// Location used for compiler-provided entities.
    pub fn builtin() -> Self {
        SourceLocation::new(Arc::from("<builtin>"), 0, 0, 0, 0)
    }

    /// Extends `self` so that it ends where `other` ends.
    pub fn to(&self, other: &SourceLocation) -> SourceLocation {
        SourceLocation {
            end: other.end,
            ..self.clone()
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}
