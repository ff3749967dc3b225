use std::path::PathBuf;

use thiserror::Error;

use crate::span::SourceLocation;

/// Every failure the compiler can report.
///
/// Compilation is fail-fast: the first error aborts the module and no
/// partial output is produced.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read source: {0}")]
    SourceIo(#[from] std::io::Error),
    #[error("standard library directory was not found at {0}")]
    MissingStdlib(PathBuf),
    #[error("{location}: lex error: {message}")]
    LexError {
        location: SourceLocation,
        message: String,
    },
    #[error("{location}: parse error: {message}")]
    ParseError {
        location: SourceLocation,
        message: String,
    },
    #[error("{location}: unresolved identifier `{name}`")]
    UnresolvedIdentifier {
        name: String,
        location: SourceLocation,
    },
    #[error("{location}: unresolved type `{name}`")]
    UnresolvedType {
        name: String,
        location: SourceLocation,
    },
    #[error("{location}: no overload of `{name}` takes {found} argument(s)")]
    ArityMismatch {
        name: String,
        found: usize,
        location: SourceLocation,
    },
    #[error("{location}: call to `{name}` is ambiguous between {}", .candidates.join(", "))]
    AmbiguousOverload {
        name: String,
        candidates: Vec<String>,
        location: SourceLocation,
    },
    #[error("{location}: type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: String,
        location: SourceLocation,
    },
    #[error("{location}: `{name}` expects {expected} type argument(s) but {found} were given")]
    InvalidGenericArgs {
        name: String,
        expected: usize,
        found: usize,
        location: SourceLocation,
    },
    #[error("{location}: cyclic instantiation of `{name}`")]
    CyclicInstantiation {
        name: String,
        location: SourceLocation,
    },
    #[error("{location}: match on `{scrutinee}` does not handle {}", .missing.join(", "))]
    NonExhaustiveMatch {
        scrutinee: String,
        missing: Vec<String>,
        location: SourceLocation,
    },
    #[error("{location}: invalid pattern: {message}")]
    InvalidPattern {
        message: String,
        location: SourceLocation,
    },
    #[error("{location}: `{name}` is already defined in this scope")]
    DuplicateBinding {
        name: String,
        location: SourceLocation,
    },
    #[error("{location}: `{name}` inherits from itself")]
    CyclicInheritance {
        name: String,
        location: SourceLocation,
    },
    #[error("{location}: cannot assign to `{name}`")]
    InvalidAssignment {
        name: String,
        location: SourceLocation,
    },
    #[error("{location}: semantic error: {message}")]
    SemanticError {
        message: String,
        location: SourceLocation,
    },
}

impl CoreError {
    pub(crate) fn semantic(message: impl Into<String>, location: &SourceLocation) -> Self {
        CoreError::SemanticError {
            message: message.into(),
            location: location.clone(),
        }
    }

    pub(crate) fn mismatch(
        expected: impl Into<String>,
        found: impl Into<String>,
        location: &SourceLocation,
    ) -> Self {
        CoreError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
            location: location.clone(),
        }
    }

    /// Where the error was detected, when it refers to source text.
    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            CoreError::SourceIo(_) | CoreError::MissingStdlib(_) => None,
            CoreError::LexError { location, .. }
            | CoreError::ParseError { location, .. }
            | CoreError::UnresolvedIdentifier { location, .. }
            | CoreError::UnresolvedType { location, .. }
            | CoreError::ArityMismatch { location, .. }
            | CoreError::AmbiguousOverload { location, .. }
            | CoreError::TypeMismatch { location, .. }
            | CoreError::InvalidGenericArgs { location, .. }
            | CoreError::CyclicInstantiation { location, .. }
            | CoreError::NonExhaustiveMatch { location, .. }
            | CoreError::InvalidPattern { location, .. }
            | CoreError::DuplicateBinding { location, .. }
            | CoreError::CyclicInheritance { location, .. }
            | CoreError::InvalidAssignment { location, .. }
            | CoreError::SemanticError { location, .. } => Some(location),
        }
    }
}
