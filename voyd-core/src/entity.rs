//! Named entities: everything a name can be bound to.
//!
//! Entities live in one arena owned by the compilation `Context` and are
//! referred to by `EntityId`. They are created during declaration
//! scanning (or by the generic instantiator), mutated in place while
//! types are resolved, and never destroyed within a compile.

use crate::builtins::Intrinsic;
use crate::hir::{ExprId, TypeExpr};
use crate::scope::ScopeId;
use crate::span::SourceLocation;
use crate::types::{Prim, Type};

macro_rules! define_id {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $name(u32);

        impl $name {
            pub fn new(index: u32) -> Self {
                Self(index)
            }

            pub fn index(self) -> u32 {
                self.0
            }
        }
    };
}

pub(crate) use define_id;

define_id! {
    /// Identity of a named entity. Also used as the runtime type id of
    /// object types.
    pub struct EntityId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Pending,
    InProgress,
    Done,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub location: SourceLocation,
    pub kind: EntityKind,
}

#[derive(Debug, Clone)]
pub enum EntityKind {
    Primitive(Prim),
    /// The builtin generic `FixedArray<T>`.
    ArrayType,
    Object(ObjectDef),
    Fn(FnDef),
    Variable(VarDef),
    Alias(AliasDef),
    Module(ModuleDef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

/// A nominal object type, or a generic object definition.
#[derive(Debug, Clone)]
pub struct ObjectDef {
    /// Scope type names in the declaration are resolved in.
    pub scope: ScopeId,
    pub type_params: Vec<String>,
    /// Concrete arguments, for instances of a generic definition.
    pub applied_args: Vec<Type>,
    pub generic_of: Option<EntityId>,
    pub parent_expr: Option<TypeExpr>,
    pub field_exprs: Vec<(String, TypeExpr)>,
    /// Resolved supertype. `None` only for the implicit base `Object`.
    pub parent: Option<EntityId>,
    /// Resolved layout: inherited fields first, in parent order.
    pub fields: Vec<Field>,
    pub state: ResolveState,
    pub instances: Vec<(Vec<Type>, EntityId)>,
    /// Functions declared in `impl` blocks for this type. Instances share
    /// the methods of their generic definition.
    pub methods: Vec<EntityId>,
}

impl ObjectDef {
    pub fn is_generic(&self) -> bool {
        !self.type_params.is_empty()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct ParamDecl {
    pub name: String,
    pub annotation: TypeExpr,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub enum FnBody {
    /// HIR body occupying the contiguous arena range `[first, root]`.
    Expr { first: ExprId, root: ExprId },
    Intrinsic(Intrinsic),
    /// Supplied by the host as `module.name`.
    Import { module: String, name: String },
}

#[derive(Debug, Clone)]
pub struct FnDef {
    /// Declaring scope; the body scope is created as its child.
    pub scope: ScopeId,
    pub type_params: Vec<String>,
    pub applied_args: Vec<Type>,
    pub generic_of: Option<EntityId>,
    pub params: Vec<ParamDecl>,
    pub return_expr: Option<TypeExpr>,
    pub body: FnBody,
    pub param_vars: Vec<EntityId>,
    pub param_types: Vec<Type>,
    pub return_type: Option<Type>,
    pub body_scope: Option<ScopeId>,
    pub signature: ResolveState,
    pub body_state: ResolveState,
    pub instances: Vec<(Vec<Type>, EntityId)>,
}

impl FnDef {
    pub fn new(scope: ScopeId, params: Vec<ParamDecl>, body: FnBody) -> Self {
        FnDef {
            scope,
            type_params: Vec::new(),
            applied_args: Vec::new(),
            generic_of: None,
            params,
            return_expr: None,
            body,
            param_vars: Vec::new(),
            param_types: Vec::new(),
            return_type: None,
            body_scope: None,
            signature: ResolveState::Pending,
            body_state: ResolveState::Pending,
            instances: Vec::new(),
        }
    }

    pub fn is_generic(&self) -> bool {
        !self.type_params.is_empty()
    }

    pub fn intrinsic(&self) -> Option<Intrinsic> {
        match self.body {
            FnBody::Intrinsic(op) => Some(op),
            _ => None,
        }
    }

    pub fn has_body(&self) -> bool {
        matches!(self.body, FnBody::Expr { .. })
    }
}

#[derive(Debug, Clone)]
pub struct VarDef {
    pub ty: Type,
    pub mutable: bool,
}

#[derive(Debug, Clone)]
pub struct AliasDef {
    pub scope: ScopeId,
    pub target: TypeExpr,
    pub resolved: Option<Type>,
    pub state: ResolveState,
}

#[derive(Debug, Clone)]
pub struct ModuleDef {
    pub scope: ScopeId,
}

impl Entity {
    pub fn is_fn(&self) -> bool {
        matches!(self.kind, EntityKind::Fn(_))
    }

    pub fn as_object(&self) -> Option<&ObjectDef> {
        match &self.kind {
            EntityKind::Object(def) => Some(def),
            _ => None,
        }
    }

    pub fn as_fn(&self) -> Option<&FnDef> {
        match &self.kind {
            EntityKind::Fn(def) => Some(def),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&ModuleDef> {
        match &self.kind {
            EntityKind::Module(def) => Some(def),
            _ => None,
        }
    }
}

/// Arena of every entity created during a compile.
#[derive(Debug, Default)]
pub struct EntityTable {
    entities: Vec<Entity>,
}

impl EntityTable {
    pub fn new() -> Self {
        EntityTable::default()
    }

    pub fn alloc(
        &mut self,
        name: impl Into<String>,
        location: SourceLocation,
        kind: EntityKind,
    ) -> EntityId {
        let id = EntityId::new(self.entities.len() as u32);
        self.entities.push(Entity {
            id,
            name: name.into(),
            location,
            kind,
        });
        id
    }

    pub fn get(&self, id: EntityId) -> &Entity {
        &self.entities[id.index() as usize]
    }

    pub fn get_mut(&mut self, id: EntityId) -> &mut Entity {
        &mut self.entities[id.index() as usize]
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn object(&self, id: EntityId) -> Option<&ObjectDef> {
        self.get(id).as_object()
    }

    pub fn object_mut(&mut self, id: EntityId) -> Option<&mut ObjectDef> {
        match &mut self.get_mut(id).kind {
            EntityKind::Object(def) => Some(def),
            _ => None,
        }
    }

    pub fn func(&self, id: EntityId) -> Option<&FnDef> {
        self.get(id).as_fn()
    }

    pub fn func_mut(&mut self, id: EntityId) -> Option<&mut FnDef> {
        match &mut self.get_mut(id).kind {
            EntityKind::Fn(def) => Some(def),
            _ => None,
        }
    }

    /// Objects whose layout is known and which can exist at runtime.
    pub fn concrete_objects(&self) -> impl Iterator<Item = (EntityId, &ObjectDef)> {
        self.entities.iter().filter_map(|entity| match &entity.kind {
            EntityKind::Object(def) if !def.is_generic() && def.state == ResolveState::Done => {
                Some((entity.id, def))
            }
            _ => None,
        })
    }
}
