//! High-level intermediate representation (HIR).
//!
//! HIR nodes live in an `ExprArena` and refer to each other by `ExprId`.
//! Children are always allocated before their parent, so the nodes of a
//! function body occupy one contiguous range ending at the body root.
//! The type resolver fills in the `ty` of every node and the resolution
//! slots (`binding`, `target`, `scope`, ...) of the kinds that have them.

use crate::entity::{EntityId, define_id};
use crate::scope::ScopeId;
use crate::span::SourceLocation;
use crate::types::{Prim, Type};

define_id! {
    pub struct ExprId;
}

/// Type arguments bound to type parameter names.
pub type Subst = [(String, Type)];

/// Unresolved type syntax.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Named {
        name: String,
        location: SourceLocation,
    },
    /// Generic application, e.g. `(FixedArray i32)`.
    Apply {
        name: String,
        args: Vec<TypeExpr>,
        location: SourceLocation,
    },
    /// A type parameter replaced by its concrete argument.
    Resolved(Type),
}

impl TypeExpr {
    pub fn named(name: impl Into<String>, location: SourceLocation) -> Self {
        TypeExpr::Named {
            name: name.into(),
            location,
        }
    }

    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            TypeExpr::Named { location, .. } | TypeExpr::Apply { location, .. } => Some(location),
            TypeExpr::Resolved(_) => None,
        }
    }

    /// Replaces every type parameter named in `subst`.
    pub fn substitute(&self, subst: &Subst) -> TypeExpr {
        match self {
            TypeExpr::Named { name, .. } => match lookup(subst, name) {
                Some(ty) => TypeExpr::Resolved(ty.clone()),
                None => self.clone(),
            },
            TypeExpr::Apply {
                name,
                args,
                location,
            } => TypeExpr::Apply {
                name: name.clone(),
                args: args.iter().map(|arg| arg.substitute(subst)).collect(),
                location: location.clone(),
            },
            TypeExpr::Resolved(_) => self.clone(),
        }
    }
}

pub fn lookup<'a>(subst: &'a Subst, name: &str) -> Option<&'a Type> {
    subst
        .iter()
        .find_map(|(param, ty)| (param == name).then_some(ty))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Int(i64, Prim),
    Float(f64, Prim),
    Bool(bool),
}

impl Literal {
    pub fn prim(&self) -> Prim {
        match self {
            Literal::Int(_, prim) | Literal::Float(_, prim) => *prim,
            Literal::Bool(_) => Prim::Bool,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Fn(EntityId),
    /// Construction of the given object type from an object literal.
    Construct(EntityId),
    /// Field read; `index` is the position in the object layout.
    Field { object: EntityId, index: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Literal(Literal),
    Type(TypeExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub body: ExprId,
    pub location: SourceLocation,
    /// Variable holding the narrowed scrutinee inside `body`.
    pub binding: Option<EntityId>,
    /// Resolved case type, for type patterns.
    pub pattern_ty: Option<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchExpr {
    pub operand: ExprId,
    pub bind: Option<String>,
    pub cases: Vec<MatchCase>,
    pub default: Option<ExprId>,
    pub default_binding: Option<EntityId>,
}

impl MatchExpr {
    pub fn is_type_guard(&self) -> bool {
        self.cases
            .iter()
            .any(|case| matches!(case.pattern, Pattern::Type(_)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirExprKind {
    Literal(Literal),
    Ident {
        name: String,
        binding: Option<EntityId>,
    },
    Block {
        body: Vec<ExprId>,
        scope: Option<ScopeId>,
    },
    Let {
        name: String,
        annotation: Option<TypeExpr>,
        init: ExprId,
        mutable: bool,
        entity: Option<EntityId>,
    },
    Assign {
        name: String,
        value: ExprId,
        target: Option<EntityId>,
    },
    Call {
        name: String,
        args: Vec<ExprId>,
        type_args: Vec<TypeExpr>,
        target: Option<CallTarget>,
    },
    ObjectLiteral {
        fields: Vec<(String, ExprId)>,
    },
    If {
        cond: ExprId,
        then_branch: ExprId,
        else_branch: Option<ExprId>,
    },
    While {
        cond: ExprId,
        body: ExprId,
    },
    Match(MatchExpr),
}

impl HirExprKind {
    /// Rewrites every child id through `f`.
    fn remap_children(&mut self, mut f: impl FnMut(ExprId) -> ExprId) {
        match self {
            HirExprKind::Literal(_) | HirExprKind::Ident { .. } => {}
            HirExprKind::Block { body, .. } => body.iter_mut().for_each(|id| *id = f(*id)),
            HirExprKind::Let { init, .. } => *init = f(*init),
            HirExprKind::Assign { value, .. } => *value = f(*value),
            HirExprKind::Call { args, .. } => args.iter_mut().for_each(|id| *id = f(*id)),
            HirExprKind::ObjectLiteral { fields } => {
                fields.iter_mut().for_each(|(_, id)| *id = f(*id))
            }
            HirExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                *cond = f(*cond);
                *then_branch = f(*then_branch);
                if let Some(branch) = else_branch {
                    *branch = f(*branch);
                }
            }
            HirExprKind::While { cond, body } => {
                *cond = f(*cond);
                *body = f(*body);
            }
            HirExprKind::Match(m) => {
                m.operand = f(m.operand);
                for case in &mut m.cases {
                    case.body = f(case.body);
                }
                if let Some(default) = &mut m.default {
                    *default = f(*default);
                }
            }
        }
    }

    /// Clears resolution results and substitutes type parameters.
    fn reset_for_instance(&mut self, subst: &Subst) {
        match self {
            HirExprKind::Literal(_) | HirExprKind::ObjectLiteral { .. } => {}
            HirExprKind::While { .. } | HirExprKind::If { .. } => {}
            HirExprKind::Ident { binding, .. } => *binding = None,
            HirExprKind::Block { scope, .. } => *scope = None,
            HirExprKind::Let {
                annotation, entity, ..
            } => {
                *entity = None;
                if let Some(annotation) = annotation {
                    *annotation = annotation.substitute(subst);
                }
            }
            HirExprKind::Assign { target, .. } => *target = None,
            HirExprKind::Call {
                type_args, target, ..
            } => {
                *target = None;
                for arg in type_args.iter_mut() {
                    *arg = arg.substitute(subst);
                }
            }
            HirExprKind::Match(m) => {
                m.default_binding = None;
                for case in &mut m.cases {
                    case.binding = None;
                    case.pattern_ty = None;
                    if let Pattern::Type(texpr) = &mut case.pattern {
                        *texpr = texpr.substitute(subst);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirExpr {
    pub kind: HirExprKind,
    pub location: SourceLocation,
    pub ty: Option<Type>,
}

#[derive(Debug, Default)]
pub struct ExprArena {
    exprs: Vec<HirExpr>,
}

impl ExprArena {
    pub fn new() -> Self {
        ExprArena::default()
    }

    pub fn alloc(&mut self, kind: HirExprKind, location: SourceLocation) -> ExprId {
        let id = self.next_id();
        self.exprs.push(HirExpr {
            kind,
            location,
            ty: None,
        });
        id
    }

    pub fn next_id(&self) -> ExprId {
        ExprId::new(self.exprs.len() as u32)
    }

    pub fn get(&self, id: ExprId) -> &HirExpr {
        &self.exprs[id.index() as usize]
    }

    pub fn get_mut(&mut self, id: ExprId) -> &mut HirExpr {
        &mut self.exprs[id.index() as usize]
    }

    /// Resolved type of `id`. Only meaningful after resolution.
    pub fn ty(&self, id: ExprId) -> Type {
        self.get(id).ty.clone().unwrap_or(Type::VOID)
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Copies the subtree stored in `[first, root]` to the end of the
    /// arena, returning the new `(first, root)`.
    ///
    /// The copy starts unresolved and has `subst` applied to every type
    /// expression it contains.
    pub fn clone_range(&mut self, first: ExprId, root: ExprId, subst: &Subst) -> (ExprId, ExprId) {
        let new_first = self.next_id();
        let offset = new_first.index() - first.index();
        for index in first.index()..=root.index() {
            let mut expr = self.exprs[index as usize].clone();
            expr.ty = None;
            expr.kind.remap_children(|child| ExprId::new(child.index() + offset));
            expr.kind.reset_for_instance(subst);
            self.exprs.push(expr);
        }
        (new_first, ExprId::new(root.index() + offset))
    }
}
