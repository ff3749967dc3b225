//! Type resolution.
//!
//! A post-order walk over every declaration that assigns a concrete type
//! to each HIR node and resolves every call to exactly one target. Object
//! layouts are resolved before any function so that subtype checks in
//! bodies always see complete ancestor chains. Generic definitions are
//! never resolved themselves; their instances are, on creation.

mod call;
mod matching;

use crate::context::Context;
use crate::entity::{EntityId, EntityKind, Field, FnBody, ResolveState, VarDef};
use crate::error::CoreError;
use crate::generics;
use crate::hir::{ExprId, HirExprKind, TypeExpr};
use crate::scope::{ScopeId, ScopeKind};
use crate::span::SourceLocation;
use crate::types::{Prim, Type};

/// Resolves every non-generic declaration known to `ctx`.
#[tracing::instrument(level = "debug", skip_all, fields(entities = ctx.entities.len()))]
pub fn resolve_program(ctx: &mut Context) -> Result<(), CoreError> {
    let count = ctx.entities.len();
    let ids = || (0..count).map(|index| EntityId::new(index as u32));

    for id in ids() {
        let (is_object, is_alias) = match &ctx.entities.get(id).kind {
            EntityKind::Object(def) => (!def.is_generic(), false),
            EntityKind::Alias(_) => (false, true),
            _ => (false, false),
        };
        if is_object {
            resolve_object(ctx, id)?;
        } else if is_alias {
            resolve_alias(ctx, id)?;
        }
    }
    attach_methods(ctx)?;
    for id in ids() {
        let is_body = ctx
            .entities
            .func(id)
            .is_some_and(|def| !def.is_generic() && def.intrinsic().is_none());
        if is_body {
            resolve_body(ctx, id)?;
        }
    }
    matching::check_coverage(ctx)?;
    tracing::debug!(entities = ctx.entities.len(), "resolved program");
    Ok(())
}

/// Adds the methods of every `impl` block to its target's definition.
fn attach_methods(ctx: &mut Context) -> Result<(), CoreError> {
    for block in std::mem::take(&mut ctx.pending_impls) {
        let (name, location) = match &block.target {
            TypeExpr::Named { name, location } | TypeExpr::Apply { name, location, .. } => {
                (name.as_str(), location)
            }
            TypeExpr::Resolved(_) => continue,
        };
        let unresolved = || CoreError::UnresolvedType {
            name: name.to_string(),
            location: location.clone(),
        };
        let id = ctx
            .scopes
            .resolve(&ctx.entities, block.scope, name)
            .ok_or_else(unresolved)?;
        let object = match classify(ctx, id) {
            TypeEntity::Object { .. } => id,
            TypeEntity::Alias => match resolve_alias(ctx, id)? {
                Type::Object(object) => object,
                _ => return Err(unresolved()),
            },
            _ => return Err(unresolved()),
        };
        let owner = ctx
            .entities
            .object(object)
            .and_then(|def| def.generic_of)
            .unwrap_or(object);
        if let Some(def) = ctx.entities.object_mut(owner) {
            def.methods.extend(block.methods);
        }
        tracing::trace!(target = %ctx.entity_display_name(owner), "attached impl");
    }
    Ok(())
}

enum TypeEntity {
    Prim(Prim),
    Object { type_params: usize },
    Array,
    Alias,
    NotAType,
}

fn classify(ctx: &Context, id: EntityId) -> TypeEntity {
    match &ctx.entities.get(id).kind {
        EntityKind::Primitive(prim) => TypeEntity::Prim(*prim),
        EntityKind::Object(def) => TypeEntity::Object {
            type_params: def.type_params.len(),
        },
        EntityKind::ArrayType => TypeEntity::Array,
        EntityKind::Alias(_) => TypeEntity::Alias,
        _ => TypeEntity::NotAType,
    }
}

fn generic_args(name: &str, expected: usize, found: usize, location: &SourceLocation) -> CoreError {
    CoreError::InvalidGenericArgs {
        name: name.to_string(),
        expected,
        found,
        location: location.clone(),
    }
}

/// Resolves type syntax seen from `scope`, instantiating generic objects
/// on concrete application.
pub fn resolve_type_expr(
    ctx: &mut Context,
    texpr: &TypeExpr,
    scope: ScopeId,
) -> Result<Type, CoreError> {
    let (name, args, location) = match texpr {
        TypeExpr::Resolved(ty) => return Ok(ty.clone()),
        TypeExpr::Named { name, location } => (name, None, location),
        TypeExpr::Apply {
            name,
            args,
            location,
        } => (name, Some(args), location),
    };
    let unresolved = || CoreError::UnresolvedType {
        name: name.clone(),
        location: location.clone(),
    };
    let id = ctx
        .scopes
        .resolve(&ctx.entities, scope, name)
        .ok_or_else(unresolved)?;

    let Some(args) = args else {
        return match classify(ctx, id) {
            TypeEntity::Prim(prim) => Ok(Type::Prim(prim)),
            TypeEntity::Object { type_params: 0 } => Ok(Type::Object(id)),
            TypeEntity::Object { type_params } => Err(generic_args(name, type_params, 0, location)),
            TypeEntity::Array => Err(generic_args(name, 1, 0, location)),
            TypeEntity::Alias => resolve_alias(ctx, id),
            TypeEntity::NotAType => Err(unresolved()),
        };
    };

    let args = args
        .iter()
        .map(|arg| resolve_type_expr(ctx, arg, scope))
        .collect::<Result<Vec<_>, _>>()?;
    match classify(ctx, id) {
        TypeEntity::Array => match <[Type; 1]>::try_from(args) {
            Ok([elem]) => Ok(Type::Array(Box::new(elem))),
            Err(args) => Err(generic_args(name, 1, args.len(), location)),
        },
        TypeEntity::Object { type_params } if type_params > 0 => {
            generics::instantiate_object(ctx, id, args, location).map(Type::Object)
        }
        TypeEntity::Prim(_) | TypeEntity::Object { .. } | TypeEntity::Alias => {
            Err(generic_args(name, 0, args.len(), location))
        }
        TypeEntity::NotAType => Err(unresolved()),
    }
}

pub(crate) fn resolve_alias(ctx: &mut Context, id: EntityId) -> Result<Type, CoreError> {
    let entity = ctx.entities.get(id);
    let EntityKind::Alias(def) = &entity.kind else {
        return Err(CoreError::semantic(
            format!("`{}` is not a type alias", entity.name),
            &entity.location,
        ));
    };
    match def.state {
        ResolveState::Done => {
            if let Some(ty) = &def.resolved {
                return Ok(ty.clone());
            }
        }
        ResolveState::InProgress => {
            return Err(CoreError::UnresolvedType {
                name: entity.name.clone(),
                location: entity.location.clone(),
            });
        }
        ResolveState::Pending => {}
    }
    let (scope, target) = (def.scope, def.target.clone());
    set_alias(ctx, id, None, ResolveState::InProgress);
    let ty = resolve_type_expr(ctx, &target, scope)?;
    set_alias(ctx, id, Some(ty.clone()), ResolveState::Done);
    Ok(ty)
}

fn set_alias(ctx: &mut Context, id: EntityId, resolved: Option<Type>, state: ResolveState) {
    if let EntityKind::Alias(def) = &mut ctx.entities.get_mut(id).kind {
        def.resolved = resolved;
        def.state = state;
    }
}

/// Resolves the parent and field layout of a concrete object type.
pub(crate) fn resolve_object(ctx: &mut Context, id: EntityId) -> Result<(), CoreError> {
    let entity = ctx.entities.get(id);
    let (name, location) = (entity.name.clone(), entity.location.clone());
    let Some(def) = entity.as_object() else {
        return Err(CoreError::semantic(
            format!("`{name}` is not an object type"),
            &location,
        ));
    };
    match def.state {
        ResolveState::Done => return Ok(()),
        ResolveState::InProgress => {
            return Err(CoreError::CyclicInheritance { name, location });
        }
        ResolveState::Pending if def.is_generic() => return Ok(()),
        ResolveState::Pending => {}
    }
    let scope = def.scope;
    let parent_expr = def.parent_expr.clone();
    let field_exprs = def.field_exprs.clone();
    if let Some(def) = ctx.entities.object_mut(id) {
        def.state = ResolveState::InProgress;
    }

    let parent = match parent_expr {
        Some(texpr) => match resolve_type_expr(ctx, &texpr, scope)? {
            Type::Object(parent) => parent,
            other => {
                let found = ctx.type_name(&other);
                return Err(CoreError::mismatch("an object type", found, &location));
            }
        },
        None => ctx.builtins.object,
    };
    resolve_object(ctx, parent)?;
    if let Some(def) = ctx.entities.object_mut(id) {
        def.parent = Some(parent);
    }

    let mut fields = ctx
        .entities
        .object(parent)
        .map(|def| def.fields.clone())
        .unwrap_or_default();
    for (field, texpr) in field_exprs {
        let ty = resolve_type_expr(ctx, &texpr, scope)?;
        if !ty.has_value() {
            return Err(CoreError::semantic(
                format!("field `{field}` cannot have type {}", ctx.type_name(&ty)),
                texpr.location().unwrap_or(&location),
            ));
        }
        match fields.iter().find(|existing| existing.name == field) {
            Some(inherited) if inherited.ty != ty => {
                let expected = ctx.type_name(&inherited.ty);
                return Err(CoreError::mismatch(expected, ctx.type_name(&ty), &location));
            }
            Some(_) => {}
            None => fields.push(Field { name: field, ty }),
        }
    }

    if let Some(def) = ctx.entities.object_mut(id) {
        def.fields = fields;
        def.state = ResolveState::Done;
    }
    tracing::trace!(object = %ctx.entity_display_name(id), "resolved layout");
    Ok(())
}

/// Resolves parameter and declared return types of a function.
pub(crate) fn resolve_signature(ctx: &mut Context, id: EntityId) -> Result<(), CoreError> {
    let entity = ctx.entities.get(id);
    let Some(def) = entity.as_fn() else {
        return Err(CoreError::semantic(
            format!("`{}` is not a function", entity.name),
            &entity.location,
        ));
    };
    if def.signature == ResolveState::Done {
        return Ok(());
    }
    let scope = def.scope;
    let params = def.params.clone();
    let return_expr = def.return_expr.clone();
    let has_body = def.has_body();
    let imported = matches!(def.body, FnBody::Import { .. });

    let mut param_types = Vec::with_capacity(params.len());
    for param in &params {
        let ty = resolve_type_expr(ctx, &param.annotation, scope)?;
        if !ty.has_value() {
            return Err(CoreError::semantic(
                format!("parameter `{}` cannot have type {}", param.name, ctx.type_name(&ty)),
                &param.location,
            ));
        }
        param_types.push(ty);
    }
    let mut return_type = return_expr
        .map(|texpr| resolve_type_expr(ctx, &texpr, scope))
        .transpose()?;
    if imported && return_type.is_none() {
        return_type = Some(Type::VOID);
    }
    let param_vars = if has_body {
        params
            .iter()
            .zip(&param_types)
            .map(|(param, ty)| {
                ctx.entities.alloc(
                    param.name.as_str(),
                    param.location.clone(),
                    EntityKind::Variable(VarDef {
                        ty: ty.clone(),
                        mutable: false,
                    }),
                )
            })
            .collect()
    } else {
        Vec::new()
    };

    if let Some(def) = ctx.entities.func_mut(id) {
        def.param_types = param_types;
        def.param_vars = param_vars;
        def.return_type = return_type;
        def.signature = ResolveState::Done;
    }
    Ok(())
}

/// Resolves the body of a function, inferring its return type when none
/// was declared.
pub(crate) fn resolve_body(ctx: &mut Context, id: EntityId) -> Result<(), CoreError> {
    resolve_signature(ctx, id)?;
    let entity = ctx.entities.get(id);
    let location = entity.location.clone();
    let Some(def) = entity.as_fn() else {
        return Ok(());
    };
    if def.body_state != ResolveState::Pending {
        return Ok(());
    }
    let FnBody::Expr { root, .. } = def.body else {
        if let Some(def) = ctx.entities.func_mut(id) {
            def.body_state = ResolveState::Done;
        }
        return Ok(());
    };
    let declared = def.return_type.clone();
    let param_vars = def.param_vars.clone();
    let scope = ctx.scopes.push(def.scope, ScopeKind::Function);
    if let Some(def) = ctx.entities.func_mut(id) {
        def.body_state = ResolveState::InProgress;
        def.body_scope = Some(scope);
    }
    for var in param_vars {
        ctx.scopes.register(&ctx.entities, scope, var)?;
    }

    let body_ty = resolve_expr(ctx, root, scope)?;
    let return_type = match declared {
        Some(declared) if declared.is_void() => declared,
        Some(declared) => {
            if !ctx.is_assignable(&body_ty, &declared) {
                let expected = ctx.type_name(&declared);
                let found = ctx.type_name(&body_ty);
                return Err(CoreError::mismatch(
                    expected,
                    found,
                    &ctx.exprs.get(root).location,
                ));
            }
            declared
        }
        None if body_ty.is_never() => {
            return Err(CoreError::UnresolvedType {
                name: format!("return type of `{}`", ctx.entity_display_name(id)),
                location,
            });
        }
        None => body_ty,
    };
    if let Some(def) = ctx.entities.func_mut(id) {
        def.return_type = Some(return_type);
        def.body_state = ResolveState::Done;
    }
    Ok(())
}

/// Return type of `id`, resolving its body first when the type is inferred.
pub(crate) fn fn_return_type(
    ctx: &mut Context,
    id: EntityId,
    location: &SourceLocation,
) -> Result<Type, CoreError> {
    resolve_signature(ctx, id)?;
    let unresolved = |ctx: &Context| CoreError::UnresolvedType {
        name: format!("return type of `{}`", ctx.entity_display_name(id)),
        location: location.clone(),
    };
    let Some(def) = ctx.entities.func(id) else {
        return Err(unresolved(ctx));
    };
    if let Some(ty) = &def.return_type {
        return Ok(ty.clone());
    }
    if def.body_state == ResolveState::InProgress {
        return Err(unresolved(ctx));
    }
    resolve_body(ctx, id)?;
    ctx.entities
        .func(id)
        .and_then(|def| def.return_type.clone())
        .ok_or_else(|| unresolved(ctx))
}

/// Resolves `id` and every node below it; returns and records its type.
pub(crate) fn resolve_expr(
    ctx: &mut Context,
    id: ExprId,
    scope: ScopeId,
) -> Result<Type, CoreError> {
    let expr = ctx.exprs.get(id);
    let kind = expr.kind.clone();
    let location = expr.location.clone();

    let ty = match kind {
        HirExprKind::Literal(literal) => Type::Prim(literal.prim()),
        HirExprKind::Ident { name, .. } => {
            let binding = lookup_variable(ctx, scope, &name, &location)?;
            if let HirExprKind::Ident { binding: slot, .. } = &mut ctx.exprs.get_mut(id).kind {
                *slot = Some(binding.0);
            }
            binding.1.ty
        }
        HirExprKind::Block { body, .. } => {
            let inner = ctx.scopes.push(scope, ScopeKind::Block);
            let mut last = Type::VOID;
            for item in body {
                last = resolve_expr(ctx, item, inner)?;
            }
            if let HirExprKind::Block { scope: slot, .. } = &mut ctx.exprs.get_mut(id).kind {
                *slot = Some(inner);
            }
            last
        }
        HirExprKind::Let {
            name,
            annotation,
            init,
            mutable,
            ..
        } => {
            let init_ty = resolve_expr(ctx, init, scope)?;
            let ty = match annotation {
                Some(annotation) => {
                    let declared = resolve_type_expr(ctx, &annotation, scope)?;
                    expect_assignable(ctx, &init_ty, &declared, init)?;
                    declared
                }
                None => init_ty,
            };
            if !ty.has_value() {
                return Err(CoreError::semantic(
                    format!("`{name}` cannot hold a value of type {}", ctx.type_name(&ty)),
                    &location,
                ));
            }
            let var = ctx.entities.alloc(
                name,
                location.clone(),
                EntityKind::Variable(VarDef { ty, mutable }),
            );
            ctx.scopes.register(&ctx.entities, scope, var)?;
            if let HirExprKind::Let { entity, .. } = &mut ctx.exprs.get_mut(id).kind {
                *entity = Some(var);
            }
            Type::VOID
        }
        HirExprKind::Assign { name, value, .. } => {
            let (target, var) = lookup_variable(ctx, scope, &name, &location)?;
            if !var.mutable {
                return Err(CoreError::InvalidAssignment { name, location });
            }
            let value_ty = resolve_expr(ctx, value, scope)?;
            expect_assignable(ctx, &value_ty, &var.ty, value)?;
            if let HirExprKind::Assign { target: slot, .. } = &mut ctx.exprs.get_mut(id).kind {
                *slot = Some(target);
            }
            Type::VOID
        }
        HirExprKind::Call {
            name,
            args,
            type_args,
            ..
        } => call::resolve_call(ctx, id, scope, &name, &args, &type_args)?,
        HirExprKind::ObjectLiteral { .. } => {
            return Err(CoreError::semantic(
                "object literals are only valid as constructor arguments",
                &location,
            ));
        }
        HirExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            let cond_ty = resolve_expr(ctx, cond, scope)?;
            expect_assignable(ctx, &cond_ty, &Type::BOOL, cond)?;
            let then_scope = ctx.scopes.push(scope, ScopeKind::Block);
            let then_ty = resolve_expr(ctx, then_branch, then_scope)?;
            match else_branch {
                Some(else_branch) => {
                    let else_scope = ctx.scopes.push(scope, ScopeKind::Block);
                    let else_ty = resolve_expr(ctx, else_branch, else_scope)?;
                    join(ctx, &then_ty, &else_ty, &location)?
                }
                None => Type::VOID,
            }
        }
        HirExprKind::While { cond, body } => {
            let cond_ty = resolve_expr(ctx, cond, scope)?;
            expect_assignable(ctx, &cond_ty, &Type::BOOL, cond)?;
            let body_scope = ctx.scopes.push(scope, ScopeKind::Block);
            resolve_expr(ctx, body, body_scope)?;
            Type::VOID
        }
        HirExprKind::Match(m) => matching::resolve_match(ctx, id, scope, m)?,
    };

    ctx.exprs.get_mut(id).ty = Some(ty.clone());
    Ok(ty)
}

fn lookup_variable(
    ctx: &Context,
    scope: ScopeId,
    name: &str,
    location: &SourceLocation,
) -> Result<(EntityId, VarDef), CoreError> {
    let id = ctx
        .scopes
        .resolve(&ctx.entities, scope, name)
        .ok_or_else(|| CoreError::UnresolvedIdentifier {
            name: name.to_string(),
            location: location.clone(),
        })?;
    match &ctx.entities.get(id).kind {
        EntityKind::Variable(var) => Ok((id, var.clone())),
        _ => Err(CoreError::semantic(
            format!("`{name}` is not a value"),
            location,
        )),
    }
}

/// Fails with `TypeMismatch` at `expr` unless `found` fits `expected`.
pub(crate) fn expect_assignable(
    ctx: &mut Context,
    found: &Type,
    expected: &Type,
    expr: ExprId,
) -> Result<(), CoreError> {
    if ctx.is_assignable(found, expected) {
        return Ok(());
    }
    Err(CoreError::mismatch(
        ctx.type_name(expected),
        ctx.type_name(found),
        &ctx.exprs.get(expr).location,
    ))
}

/// Branch join for `if` and `match` arms.
pub(crate) fn join(
    ctx: &mut Context,
    a: &Type,
    b: &Type,
    location: &SourceLocation,
) -> Result<Type, CoreError> {
    ctx.join_types(a, b)
        .ok_or_else(|| CoreError::mismatch(ctx.type_name(a), ctx.type_name(b), location))
}
