//! Core type representation.
//!
//! Types are small closed values. Nominal object types refer to their
//! defining entity by id, so two types are equal exactly when they name
//! the same entity (or the same instance of a generic entity).

use std::fmt;

use crate::entity::EntityId;

/// Built-in primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prim {
    I32,
    I64,
    F32,
    F64,
    Bool,
    Void,
}

impl Prim {
    pub const ALL: [Prim; 6] = [
        Prim::I32,
        Prim::I64,
        Prim::F32,
        Prim::F64,
        Prim::Bool,
        Prim::Void,
    ];

    pub fn from_name(name: &str) -> Option<Prim> {
        Prim::ALL.into_iter().find(|prim| prim.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Prim::I32 => "i32",
            Prim::I64 => "i64",
            Prim::F32 => "f32",
            Prim::F64 => "f64",
            Prim::Bool => "bool",
            Prim::Void => "void",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Prim::F32 | Prim::F64)
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The type of a value or expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Prim(Prim),
    /// A concrete nominal object type (never an uninstantiated generic).
    Object(EntityId),
    /// `FixedArray<T>`.
    Array(Box<Type>),
    /// Bottom type. Only produced for arms that trap.
    Never,
}

impl Type {
    pub const I32: Type = Type::Prim(Prim::I32);
    pub const I64: Type = Type::Prim(Prim::I64);
    pub const F32: Type = Type::Prim(Prim::F32);
    pub const F64: Type = Type::Prim(Prim::F64);
    pub const BOOL: Type = Type::Prim(Prim::Bool);
    pub const VOID: Type = Type::Prim(Prim::Void);

    pub fn is_never(&self) -> bool {
        matches!(self, Type::Never)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Prim(Prim::Void))
    }

    /// True when values of this type occupy a wasm value slot.
    pub fn has_value(&self) -> bool {
        !self.is_void() && !self.is_never()
    }

    pub fn as_object(&self) -> Option<EntityId> {
        match self {
            Type::Object(id) => Some(*id),
            _ => None,
        }
    }
}

/// Compute the least common supertype (LCS) of two types, if it exists.
///
/// Used to type `if` and `match` expressions, where Never is bottom:
///
/// * lcs(Never, T) = T
/// * lcs(T, T)     = T
/// * lcs(A, B)     = nearest common ancestor, for object types
///
/// Primitives and arrays only join with themselves.
pub fn least_common_supertype(
    a: &Type,
    b: &Type,
    mut common_ancestor: impl FnMut(EntityId, EntityId) -> Option<EntityId>,
) -> Option<Type> {
    if a.is_never() {
        return Some(b.clone());
    }
    if b.is_never() {
        return Some(a.clone());
    }
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (Type::Object(left), Type::Object(right)) => {
            common_ancestor(*left, *right).map(Type::Object)
        }
        _ => None,
    }
}
