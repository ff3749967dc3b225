//! Compilation state threaded through every phase.

use crate::builtins::{Builtins, register_builtins};
use crate::entity::{EntityId, EntityKind, EntityTable};
use crate::error::CoreError;
use crate::hir::{ExprArena, TypeExpr};
use crate::inheritance::InheritanceEncoder;
use crate::scope::{ScopeId, ScopeTable};
use crate::span::SourceLocation;
use crate::types::{Type, least_common_supertype};

/// A `use` form waiting for every module to be scanned.
#[derive(Debug, Clone)]
pub struct PendingUse {
    pub scope: ScopeId,
    pub path: Vec<String>,
    pub alias: Option<String>,
    pub location: SourceLocation,
}

/// An `impl` block whose target type is looked up once every declaration
/// has been scanned.
#[derive(Debug, Clone)]
pub struct PendingImpl {
    pub scope: ScopeId,
    pub target: TypeExpr,
    pub methods: Vec<EntityId>,
    pub location: SourceLocation,
}

/// All mutable state of one compile. There is no global state; every
/// phase takes `&mut Context`.
#[derive(Debug)]
pub struct Context {
    pub entities: EntityTable,
    pub scopes: ScopeTable,
    pub exprs: ExprArena,
    pub inheritance: InheritanceEncoder,
    pub builtins: Builtins,
    /// `(definition, arguments)` pairs currently being instantiated.
    pub(crate) instantiating: Vec<(EntityId, Vec<Type>)>,
    /// Nesting of instantiations, bodies included.
    pub(crate) instance_depth: usize,
    pub(crate) pending_uses: Vec<PendingUse>,
    pub(crate) pending_impls: Vec<PendingImpl>,
}

impl Context {
    pub fn new() -> Result<Self, CoreError> {
        let mut entities = EntityTable::new();
        let mut scopes = ScopeTable::new();
        let builtins = register_builtins(&mut entities, &mut scopes)?;
        Ok(Context {
            entities,
            scopes,
            exprs: ExprArena::new(),
            inheritance: InheritanceEncoder::new(),
            builtins,
            instantiating: Vec::new(),
            instance_depth: 0,
            pending_uses: Vec::new(),
            pending_impls: Vec::new(),
        })
    }

    /// Human-readable type name, used in diagnostics and generated names.
    pub fn type_name(&self, ty: &Type) -> String {
        match ty {
            Type::Prim(prim) => prim.name().to_string(),
            Type::Object(id) => self.entity_display_name(*id),
            Type::Array(elem) => format!("FixedArray<{}>", self.type_name(elem)),
            Type::Never => "never".to_string(),
        }
    }

    /// Entity name with its type arguments, e.g. `VecBox<PointF>`.
    pub fn entity_display_name(&self, id: EntityId) -> String {
        let entity = self.entities.get(id);
        let args = match &entity.kind {
            EntityKind::Object(def) => &def.applied_args,
            EntityKind::Fn(def) => &def.applied_args,
            _ => return entity.name.clone(),
        };
        if args.is_empty() {
            return entity.name.clone();
        }
        let args: Vec<String> = args.iter().map(|arg| self.type_name(arg)).collect();
        format!("{}<{}>", entity.name, args.join(", "))
    }

    /// Whether a value of type `from` can be used where `to` is expected.
    pub fn is_assignable(&mut self, from: &Type, to: &Type) -> bool {
        if from == to || from.is_never() {
            return true;
        }
        match (from, to) {
            (Type::Object(sub), Type::Object(sup)) => {
                self.inheritance.extends(&self.entities, *sub, *sup)
            }
            _ => false,
        }
    }

    /// Branch type of `if` / `match`; `None` when the types do not join.
    pub fn join_types(&mut self, a: &Type, b: &Type) -> Option<Type> {
        let inheritance = &mut self.inheritance;
        let entities = &self.entities;
        least_common_supertype(a, b, |left, right| {
            inheritance.common_ancestor(entities, left, right)
        })
    }
}
