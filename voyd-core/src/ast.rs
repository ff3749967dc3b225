use crate::span::SourceLocation;
use crate::types::Prim;

/// One node of the normalized expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Syntax {
    pub kind: SyntaxKind,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyntaxKind {
    Ident(String),
    Int { value: i64, ty: Prim },
    Float { value: f64, ty: Prim },
    Bool(bool),
    /// Quoted text; only used for import namespaces.
    Str(String),
    List(Vec<Syntax>),
}

impl Syntax {
    pub fn ident(&self) -> Option<&str> {
        match &self.kind {
            SyntaxKind::Ident(name) => Some(name),
            _ => None,
        }
    }

    pub fn string(&self) -> Option<&str> {
        match &self.kind {
            SyntaxKind::Str(text) => Some(text),
            _ => None,
        }
    }

    pub fn list(&self) -> Option<&[Syntax]> {
        match &self.kind {
            SyntaxKind::List(items) => Some(items),
            _ => None,
        }
    }

    /// Identifier at the head of a list form.
    pub fn head(&self) -> Option<&str> {
        self.list()?.first()?.ident()
    }

    pub fn is_call(&self, name: &str) -> bool {
        self.head() == Some(name)
    }

    /// Elements after the head of a list form.
    pub fn tail(&self) -> &[Syntax] {
        match self.list() {
            Some([_, rest @ ..]) => rest,
            _ => &[],
        }
    }
}
