//! Typing of `match` expressions.
//!
//! Literal matches compare a primitive scrutinee against literals of the
//! same type. Type-guard matches test an object scrutinee against object
//! types related to its static type; inside each case the bind variable
//! (explicit, or the operand identifier itself) is re-bound with the case
//! type.

use crate::context::Context;
use crate::entity::{EntityId, EntityKind, VarDef};
use crate::error::CoreError;
use crate::hir::{ExprId, HirExprKind, MatchExpr, Pattern};
use crate::scope::{ScopeId, ScopeKind};
use crate::span::SourceLocation;
use crate::types::{Prim, Type};

use super::{join, resolve_expr, resolve_type_expr};

pub(super) fn resolve_match(
    ctx: &mut Context,
    id: ExprId,
    scope: ScopeId,
    mut m: MatchExpr,
) -> Result<Type, CoreError> {
    let location = ctx.exprs.get(id).location.clone();
    let operand_ty = resolve_expr(ctx, m.operand, scope)?;
    let bind = m.bind.clone().or_else(|| match &ctx.exprs.get(m.operand).kind {
        HirExprKind::Ident { name, .. } => Some(name.clone()),
        _ => None,
    });
    let type_guard = m.is_type_guard();
    let operand_object = if type_guard {
        match &operand_ty {
            Type::Object(object) => Some(*object),
            other => {
                return Err(CoreError::mismatch(
                    "an object type",
                    ctx.type_name(other),
                    &ctx.exprs.get(m.operand).location,
                ));
            }
        }
    } else {
        None
    };
    if !type_guard && !m.cases.is_empty() && !is_literal_scrutinee(&operand_ty) {
        return Err(CoreError::mismatch(
            "a primitive value",
            ctx.type_name(&operand_ty),
            &ctx.exprs.get(m.operand).location,
        ));
    }

    let mut arm_ty: Option<Type> = None;
    for case in &mut m.cases {
        let case_scope = ctx.scopes.push(scope, ScopeKind::Case);
        let (case_ty, bound) = match (&case.pattern, operand_object) {
            (Pattern::Literal(literal), _) => {
                let literal_ty = Type::Prim(literal.prim());
                if literal_ty != operand_ty {
                    return Err(CoreError::mismatch(
                        ctx.type_name(&operand_ty),
                        ctx.type_name(&literal_ty),
                        &case.location,
                    ));
                }
                // Literal cases only re-bind an explicitly named scrutinee.
                let bound = m.bind.as_ref().map(|_| operand_ty.clone());
                (None, bound)
            }
            (Pattern::Type(texpr), Some(operand)) => {
                let case_ty = resolve_type_expr(ctx, texpr, scope)?;
                let Type::Object(case_object) = &case_ty else {
                    return Err(CoreError::mismatch(
                        "an object type",
                        ctx.type_name(&case_ty),
                        &case.location,
                    ));
                };
                let related = ctx
                    .inheritance
                    .extends(&ctx.entities, *case_object, operand)
                    || ctx.inheritance.extends(&ctx.entities, operand, *case_object);
                if !related {
                    return Err(CoreError::mismatch(
                        ctx.type_name(&operand_ty),
                        ctx.type_name(&case_ty),
                        &case.location,
                    ));
                }
                (Some(case_ty.clone()), Some(case_ty))
            }
            (Pattern::Type(_), None) => {
                return Err(CoreError::InvalidPattern {
                    message: "type patterns need an object scrutinee".into(),
                    location: case.location.clone(),
                });
            }
        };
        if let (Some(name), Some(ty)) = (&bind, bound) {
            case.binding = Some(bind_case_var(ctx, case_scope, name, ty, &case.location)?);
        }
        case.pattern_ty = case_ty;
        let body_ty = resolve_expr(ctx, case.body, case_scope)?;
        arm_ty = Some(join_arm(ctx, arm_ty, &body_ty, &case.location)?);
    }

    if let Some(default) = m.default {
        let default_scope = ctx.scopes.push(scope, ScopeKind::Case);
        if let Some(name) = &m.bind {
            let default_location = ctx.exprs.get(default).location.clone();
            let binding =
                bind_case_var(ctx, default_scope, name, operand_ty.clone(), &default_location)?;
            m.default_binding = Some(binding);
        }
        let body_ty = resolve_expr(ctx, default, default_scope)?;
        arm_ty = Some(join_arm(ctx, arm_ty, &body_ty, &location)?);
    }

    tracing::trace!(
        strategy = if type_guard { "type-guard" } else { "literal" },
        cases = m.cases.len(),
        default = m.default.is_some(),
        "typed match"
    );
    ctx.exprs.get_mut(id).kind = HirExprKind::Match(m);
    Ok(arm_ty.unwrap_or(Type::Never))
}

/// Rejects type-guard matches without a default that leave some concrete
/// subtype of the scrutinee type unhandled. Runs after every body has been
/// resolved, so the set of concrete object types is closed.
pub(super) fn check_coverage(ctx: &mut Context) -> Result<(), CoreError> {
    for index in 0..ctx.exprs.len() {
        let expr = ctx.exprs.get(ExprId::new(index as u32));
        let HirExprKind::Match(m) = &expr.kind else {
            continue;
        };
        if m.default.is_some() || !m.is_type_guard() {
            continue;
        }
        let Some(Type::Object(operand)) = ctx.exprs.get(m.operand).ty.clone() else {
            continue;
        };
        // Generic templates are never resolved and carry no case types.
        let Some(covered) = m
            .cases
            .iter()
            .map(|case| case.pattern_ty.as_ref().and_then(Type::as_object))
            .collect::<Option<Vec<_>>>()
        else {
            continue;
        };
        let location = expr.location.clone();
        check_exhaustive(ctx, operand, &covered, &location)?;
    }
    Ok(())
}

fn check_exhaustive(
    ctx: &mut Context,
    operand: EntityId,
    covered: &[EntityId],
    location: &SourceLocation,
) -> Result<(), CoreError> {
    let candidates: Vec<_> = ctx.entities.concrete_objects().map(|(id, _)| id).collect();
    let mut missing = Vec::new();
    for candidate in candidates {
        if !ctx.inheritance.extends(&ctx.entities, candidate, operand) {
            continue;
        }
        let handled = covered
            .iter()
            .any(|case| ctx.inheritance.extends(&ctx.entities, candidate, *case));
        if !handled {
            missing.push(ctx.entity_display_name(candidate));
        }
    }
    if missing.is_empty() {
        return Ok(());
    }
    tracing::debug!(?missing, "non-exhaustive type-guard match");
    Err(CoreError::NonExhaustiveMatch {
        scrutinee: ctx.type_name(&Type::Object(operand)),
        missing,
        location: location.clone(),
    })
}

fn is_literal_scrutinee(ty: &Type) -> bool {
    matches!(ty, Type::Prim(prim) if *prim != Prim::Void)
}

fn join_arm(
    ctx: &mut Context,
    acc: Option<Type>,
    next: &Type,
    location: &SourceLocation,
) -> Result<Type, CoreError> {
    match acc {
        Some(acc) => join(ctx, &acc, next, location),
        None => Ok(next.clone()),
    }
}

fn bind_case_var(
    ctx: &mut Context,
    scope: ScopeId,
    name: &str,
    ty: Type,
    location: &SourceLocation,
) -> Result<EntityId, CoreError> {
    let var = ctx.entities.alloc(
        name,
        location.clone(),
        EntityKind::Variable(VarDef { ty, mutable: false }),
    );
    ctx.scopes.register(&ctx.entities, scope, var)?;
    Ok(var)
}

#[cfg(test)]
mod tests {
    use crate::context::Context;
    use crate::entity::FnBody;
    use crate::error::CoreError;
    use crate::hir::{ExprId, HirExprKind};
    use crate::init::{declare_module, scan_module};
    use crate::parser::parse;
    use crate::resolve::resolve_program;
    use crate::span::SourceLocation;
    use crate::types::Type;

    const SHAPES: &str = "
        (obj Vec (: x i32) (: y i32))
        (obj Point (extends Vec) (: x i32) (: y i32) (: z i32))
        (obj Pointy (extends Vec) (: x i32) (: y i32) (: z i32))
        (obj Other (: w i32))
    ";

    fn resolve(source: &str) -> Result<Context, CoreError> {
        let mut ctx = Context::new()?;
        let root = ctx.scopes.root();
        let (_, scope) = declare_module(&mut ctx, root, "src", SourceLocation::builtin())?;
        let forms = parse("test.vast", &format!("{SHAPES}{source}"))?;
        scan_module(&mut ctx, scope, &forms)?;
        resolve_program(&mut ctx)?;
        Ok(ctx)
    }

    fn body_root(ctx: &Context, name: &str) -> ExprId {
        let id = ctx
            .entities
            .iter()
            .find(|entity| entity.name == name && entity.is_fn())
            .map(|entity| entity.id)
            .expect("function");
        let Some(FnBody::Expr { root, .. }) = ctx.entities.func(id).map(|def| def.body.clone())
        else {
            panic!("expected a body");
        };
        root
    }

    fn body_type(ctx: &Context, name: &str) -> Type {
        ctx.exprs.ty(body_root(ctx, name))
    }

    #[test]
    fn type_guard_cases_narrow_the_operand() {
        let ctx = resolve(
            "(fn f (parameters (: v Vec))
               (match v (=> Point (z v)) (=> Pointy (z v)) (else -1)))",
        )
        .expect("resolve");
        assert_eq!(body_type(&ctx, "f"), Type::I32);

        let HirExprKind::Match(m) = &ctx.exprs.get(body_root(&ctx, "f")).kind else {
            panic!("expected a match body");
        };
        assert!(m.cases.iter().all(|case| case.binding.is_some()));
        assert!(m.cases.iter().all(|case| case.pattern_ty.is_some()));
    }

    #[test]
    fn the_default_keeps_the_static_type() {
        let err = resolve(
            "(fn f (parameters (: v Vec)) (match v (=> Point (z v)) (else (z v))))",
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedIdentifier { .. }));
    }

    #[test]
    fn explicit_bind_names_the_narrowed_value() {
        let ctx = resolve(
            "(fn f (parameters (: v Vec)) (match v p (=> Point (z p)) (else (y p))))",
        )
        .expect("resolve");
        assert_eq!(body_type(&ctx, "f"), Type::I32);
    }

    #[test]
    fn unrelated_case_types_are_rejected() {
        let err = resolve("(fn f (parameters (: v Vec)) (match v (=> Other 1) (else 2)))")
            .unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));
    }

    #[test]
    fn literal_cases_must_match_the_scrutinee_type() {
        let err = resolve("(fn f (parameters (: n i32)) (match n (=> 1i64 1) (else 2)))")
            .unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));

        let ctx = resolve("(fn f (parameters (: n i32)) (match n (=> 1 10.5) (=> 2 20.5) (else 0.5)))")
            .expect("resolve");
        assert_eq!(body_type(&ctx, "f"), Type::F64);
    }

    #[test]
    fn arm_types_must_join() {
        let err = resolve("(fn f (parameters (: n i32)) (match n (=> 1 1) (else 2.5)))")
            .unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));
    }

    #[test]
    fn object_arms_join_to_their_common_ancestor() {
        let ctx = resolve(
            "(fn f (parameters (: n i32))
               (match n
                 (=> 1 (Point (object (: x 1) (: y 2) (: z 3))))
                 (else (Pointy (object (: x 1) (: y 2) (: z 3))))))",
        )
        .expect("resolve");
        let vec = ctx
            .entities
            .iter()
            .find(|entity| entity.name == "Vec")
            .map(|entity| entity.id)
            .expect("Vec");
        assert_eq!(body_type(&ctx, "f"), Type::Object(vec));
    }

    #[test]
    fn uncovered_subtypes_are_reported_in_uncalled_functions() {
        let err = resolve(
            "(fn which (parameters (: v Vec)) (return_type i32)
               (match v (=> Point 1) (=> Pointy 2)))",
        )
        .unwrap_err();
        match err {
            CoreError::NonExhaustiveMatch {
                scrutinee, missing, ..
            } => {
                assert_eq!(scrutinee, "Vec");
                assert_eq!(missing, ["Vec"]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn covering_the_scrutinee_type_itself_is_exhaustive() {
        resolve(
            "(fn which (parameters (: v Vec)) (return_type i32)
               (match v (=> Point 1) (=> Vec 2)))",
        )
        .expect("resolve");
        resolve("(fn which (parameters (: p Point)) (return_type i32) (match p (=> Point 1)))")
            .expect("resolve");
    }
}
