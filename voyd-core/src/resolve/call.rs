//! Call resolution: constructors, overloads and field accessors.

use crate::builtins::ARRAY_TYPE;
use crate::context::Context;
use crate::entity::{EntityId, EntityKind, ResolveState};
use crate::error::CoreError;
use crate::generics;
use crate::hir::{CallTarget, ExprId, HirExprKind, TypeExpr};
use crate::scope::ScopeId;
use crate::span::SourceLocation;
use crate::types::Type;

use super::{expect_assignable, fn_return_type, resolve_expr, resolve_signature, resolve_type_expr};

/// A candidate that accepts the call's arguments.
struct Viable {
    id: EntityId,
    score: u32,
    /// Type arguments, for generic candidates.
    type_args: Option<Vec<Type>>,
}

pub(super) fn resolve_call(
    ctx: &mut Context,
    id: ExprId,
    scope: ScopeId,
    name: &str,
    args: &[ExprId],
    type_args: &[TypeExpr],
) -> Result<Type, CoreError> {
    let location = ctx.exprs.get(id).location.clone();

    if let [arg] = args
        && let HirExprKind::ObjectLiteral { fields } = &ctx.exprs.get(*arg).kind
    {
        let fields = fields.clone();
        let object = constructed_type(ctx, scope, name, type_args, &location)?;
        construct(ctx, scope, object, *arg, &fields, &location)?;
        set_target(ctx, id, CallTarget::Construct(object));
        return Ok(Type::Object(object));
    }

    let mut arg_types = Vec::with_capacity(args.len());
    for arg in args {
        arg_types.push(resolve_expr(ctx, *arg, scope)?);
    }
    let explicit = type_args
        .iter()
        .map(|texpr| resolve_type_expr(ctx, texpr, scope))
        .collect::<Result<Vec<_>, _>>()?;

    let mut candidates = ctx.scopes.resolve_overloads(&ctx.entities, scope, name);
    if let Some(Type::Object(receiver)) = arg_types.first() {
        for method in receiver_methods(ctx, *receiver, name) {
            if !candidates.contains(&method) {
                candidates.push(method);
            }
        }
    }
    let arity_matched: Vec<EntityId> = candidates
        .iter()
        .copied()
        .filter(|candidate| {
            ctx.entities
                .func(*candidate)
                .is_some_and(|def| def.params.len() == args.len())
        })
        .collect();

    let mut viable = Vec::new();
    for candidate in &arity_matched {
        if let Some(found) = score_candidate(ctx, *candidate, &arg_types, &explicit)? {
            viable.push(found);
        }
    }

    if viable.is_empty() {
        if let Some((object, index, ty)) = field_access(ctx, name, &arg_types) {
            set_target(ctx, id, CallTarget::Field { object, index });
            return Ok(ty);
        }
        if candidates.is_empty() {
            return Err(CoreError::UnresolvedIdentifier {
                name: name.to_string(),
                location,
            });
        }
        if arity_matched.is_empty() {
            return Err(CoreError::ArityMismatch {
                name: name.to_string(),
                found: args.len(),
                location,
            });
        }
        if !explicit.is_empty() {
            let generic_counts: Vec<usize> = arity_matched
                .iter()
                .filter_map(|candidate| ctx.entities.func(*candidate))
                .map(|def| def.type_params.len())
                .filter(|count| *count > 0)
                .collect();
            if !generic_counts.contains(&explicit.len()) {
                return Err(CoreError::InvalidGenericArgs {
                    name: name.to_string(),
                    expected: generic_counts.first().copied().unwrap_or(0),
                    found: explicit.len(),
                    location,
                });
            }
        }
        let expected: Vec<String> = arity_matched
            .iter()
            .map(|candidate| signature(ctx, *candidate))
            .collect();
        let found: Vec<String> = arg_types.iter().map(|ty| ctx.type_name(ty)).collect();
        return Err(CoreError::mismatch(
            expected.join(" or "),
            format!("{name}({})", found.join(", ")),
            &location,
        ));
    }

    let best = viable.iter().map(|found| found.score).min().unwrap_or(0);
    let mut winners = viable.into_iter().filter(|found| found.score == best);
    let Some(winner) = winners.next() else {
        return Err(CoreError::UnresolvedIdentifier {
            name: name.to_string(),
            location,
        });
    };
    let rest: Vec<Viable> = winners.collect();
    if !rest.is_empty() {
        let candidates = std::iter::once(&winner)
            .chain(&rest)
            .map(|found| signature(ctx, found.id))
            .collect();
        return Err(CoreError::AmbiguousOverload {
            name: name.to_string(),
            candidates,
            location,
        });
    }

    let target = match winner.type_args {
        Some(type_args) => generics::instantiate_fn(ctx, winner.id, type_args, &location)?,
        None => winner.id,
    };
    tracing::trace!(
        call = name,
        target = %ctx.entity_display_name(target),
        score = winner.score,
        "resolved overload"
    );
    let ty = fn_return_type(ctx, target, &location)?;
    set_target(ctx, id, CallTarget::Fn(target));
    Ok(ty)
}

/// Methods named `name` declared for `receiver` or any of its ancestors.
fn receiver_methods(ctx: &Context, receiver: EntityId, name: &str) -> Vec<EntityId> {
    let mut found = Vec::new();
    let mut current = Some(receiver);
    while let Some(object) = current {
        let Some(def) = ctx.entities.object(object) else {
            break;
        };
        let owner = def.generic_of.and_then(|generic| ctx.entities.object(generic)).unwrap_or(def);
        found.extend(
            owner
                .methods
                .iter()
                .copied()
                .filter(|method| ctx.entities.get(*method).name == name),
        );
        current = def.parent;
    }
    found
}

fn set_target(ctx: &mut Context, id: ExprId, resolved: CallTarget) {
    if let HirExprKind::Call { target, .. } = &mut ctx.exprs.get_mut(id).kind {
        *target = Some(resolved);
    }
}

/// Scores `candidate` against the argument types; `None` eliminates it.
fn score_candidate(
    ctx: &mut Context,
    candidate: EntityId,
    arg_types: &[Type],
    explicit: &[Type],
) -> Result<Option<Viable>, CoreError> {
    let Some(def) = ctx.entities.func(candidate) else {
        return Ok(None);
    };
    let (param_types, type_args) = if def.is_generic() {
        let type_params = def.type_params.clone();
        let annotations: Vec<TypeExpr> =
            def.params.iter().map(|param| param.annotation.clone()).collect();
        let scope = def.scope;
        let type_args = if explicit.is_empty() {
            match infer_type_args(&type_params, &annotations, arg_types, ctx) {
                Some(inferred) => inferred,
                None => return Ok(None),
            }
        } else if explicit.len() == type_params.len() {
            explicit.to_vec()
        } else {
            return Ok(None);
        };
        let subst: Vec<(String, Type)> = type_params.into_iter().zip(type_args.clone()).collect();
        let mut param_types = Vec::with_capacity(annotations.len());
        for annotation in &annotations {
            param_types.push(resolve_type_expr(ctx, &annotation.substitute(&subst), scope)?);
        }
        (param_types, Some(type_args))
    } else {
        if !explicit.is_empty() {
            return Ok(None);
        }
        resolve_signature(ctx, candidate)?;
        let param_types = ctx
            .entities
            .func(candidate)
            .map(|def| def.param_types.clone())
            .unwrap_or_default();
        (param_types, None)
    };

    let mut score = 0;
    for (arg, param) in arg_types.iter().zip(&param_types) {
        match conversion_cost(ctx, arg, param) {
            Some(cost) => score += cost,
            None => return Ok(None),
        }
    }
    Ok(Some(Viable {
        id: candidate,
        score,
        type_args,
    }))
}

/// 0 for an exact match, the inheritance distance for a subtype, `None`
/// when the argument cannot be passed.
fn conversion_cost(ctx: &mut Context, arg: &Type, param: &Type) -> Option<u32> {
    if arg == param || arg.is_never() {
        return Some(0);
    }
    match (arg, param) {
        (Type::Object(sub), Type::Object(sup)) => {
            ctx.inheritance.distance(&ctx.entities, *sub, *sup)
        }
        _ => None,
    }
}

/// Binds type parameters by matching parameter annotations against the
/// argument types. Every parameter must be determined.
fn infer_type_args(
    type_params: &[String],
    annotations: &[TypeExpr],
    arg_types: &[Type],
    ctx: &Context,
) -> Option<Vec<Type>> {
    let mut bound: Vec<Option<Type>> = vec![None; type_params.len()];
    for (annotation, arg) in annotations.iter().zip(arg_types) {
        if !unify(ctx, type_params, annotation, arg, &mut bound) {
            return None;
        }
    }
    bound.into_iter().collect()
}

fn unify(
    ctx: &Context,
    type_params: &[String],
    pattern: &TypeExpr,
    actual: &Type,
    bound: &mut [Option<Type>],
) -> bool {
    match pattern {
        TypeExpr::Named { name, .. } => {
            let Some(index) = type_params.iter().position(|param| param == name) else {
                return true;
            };
            match &bound[index] {
                Some(existing) => existing == actual,
                None => {
                    bound[index] = Some(actual.clone());
                    true
                }
            }
        }
        TypeExpr::Apply { name, args, .. } => match actual {
            Type::Array(elem) if name == ARRAY_TYPE && args.len() == 1 => {
                unify(ctx, type_params, &args[0], elem, bound)
            }
            Type::Object(instance) => {
                let Some(def) = ctx.entities.object(*instance) else {
                    return true;
                };
                let same_generic = def
                    .generic_of
                    .is_some_and(|generic| ctx.entities.get(generic).name == *name);
                if !same_generic || def.applied_args.len() != args.len() {
                    return true;
                }
                args.iter()
                    .zip(&def.applied_args)
                    .all(|(arg, applied)| unify(ctx, type_params, arg, applied, bound))
            }
            _ => true,
        },
        TypeExpr::Resolved(_) => true,
    }
}

/// `(x v)` reads field `x` of `v` when no function accepts the call.
fn field_access(ctx: &Context, name: &str, arg_types: &[Type]) -> Option<(EntityId, u32, Type)> {
    let [Type::Object(object)] = arg_types else {
        return None;
    };
    let def = ctx.entities.object(*object)?;
    let index = def.field_index(name)?;
    Some((*object, index as u32, def.fields[index].ty.clone()))
}

/// The object type a constructor call builds.
fn constructed_type(
    ctx: &mut Context,
    scope: ScopeId,
    name: &str,
    type_args: &[TypeExpr],
    location: &SourceLocation,
) -> Result<EntityId, CoreError> {
    let texpr = if type_args.is_empty() {
        TypeExpr::named(name, location.clone())
    } else {
        TypeExpr::Apply {
            name: name.to_string(),
            args: type_args.to_vec(),
            location: location.clone(),
        }
    };
    let is_type = ctx
        .scopes
        .resolve(&ctx.entities, scope, name)
        .is_some_and(|id| {
            matches!(
                ctx.entities.get(id).kind,
                EntityKind::Object(_) | EntityKind::Alias(_)
            )
        });
    if !is_type {
        return Err(CoreError::UnresolvedType {
            name: name.to_string(),
            location: location.clone(),
        });
    }
    match resolve_type_expr(ctx, &texpr, scope)? {
        Type::Object(object) => Ok(object),
        other => Err(CoreError::semantic(
            format!("values of type {} cannot be constructed", ctx.type_name(&other)),
            location,
        )),
    }
}

/// Checks a constructor's object literal against the layout of `object`.
fn construct(
    ctx: &mut Context,
    scope: ScopeId,
    object: EntityId,
    literal: ExprId,
    fields: &[(String, ExprId)],
    location: &SourceLocation,
) -> Result<(), CoreError> {
    let layout = ctx
        .entities
        .object(object)
        .map(|def| def.fields.clone())
        .unwrap_or_default();
    for (field, value) in fields {
        let Some(slot) = layout.iter().find(|slot| slot.name == *field) else {
            return Err(CoreError::UnresolvedIdentifier {
                name: field.clone(),
                location: ctx.exprs.get(*value).location.clone(),
            });
        };
        let ty = resolve_expr(ctx, *value, scope)?;
        expect_assignable(ctx, &ty, &slot.ty, *value)?;
    }
    if fields.len() != layout.len() {
        return Err(CoreError::ArityMismatch {
            name: ctx.entity_display_name(object),
            found: fields.len(),
            location: location.clone(),
        });
    }
    ctx.exprs.get_mut(literal).ty = Some(Type::Object(object));
    Ok(())
}

/// `name(param, ...)` for diagnostics.
fn signature(ctx: &Context, id: EntityId) -> String {
    let Some(def) = ctx.entities.func(id) else {
        return ctx.entity_display_name(id);
    };
    let params: Vec<String> = if def.signature == ResolveState::Done {
        def.param_types.iter().map(|ty| ctx.type_name(ty)).collect()
    } else {
        def.params
            .iter()
            .map(|param| match &param.annotation {
                TypeExpr::Named { name, .. } | TypeExpr::Apply { name, .. } => name.clone(),
                TypeExpr::Resolved(ty) => ctx.type_name(ty),
            })
            .collect()
    };
    format!("{}({})", ctx.entity_display_name(id), params.join(", "))
}
