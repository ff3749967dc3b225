//! Generic instantiation.
//!
//! Instances are created lazily, on the first concrete application of a
//! generic object type or function, and cached on their definition keyed
//! by the ordered type arguments. A cache hit returns the identical
//! instance id. Instances are invariant in their arguments: `Box<Point>`
//! and `Box<Vec>` are unrelated types even though `Point extends Vec`.

use crate::context::Context;
use crate::entity::{EntityId, EntityKind, FnBody, FnDef, ObjectDef, ParamDecl, ResolveState};
use crate::error::CoreError;
use crate::resolve::{resolve_body, resolve_object, resolve_signature};
use crate::span::SourceLocation;
use crate::types::Type;

/// Deepest allowed nesting of instantiations.
pub const MAX_INSTANTIATION_DEPTH: usize = 64;

/// Instance of a generic object or function for `args`.
pub fn instantiate(
    ctx: &mut Context,
    generic: EntityId,
    args: Vec<Type>,
    location: &SourceLocation,
) -> Result<EntityId, CoreError> {
    if ctx.entities.get(generic).is_fn() {
        instantiate_fn(ctx, generic, args, location)
    } else {
        instantiate_object(ctx, generic, args, location)
    }
}

pub fn instantiate_object(
    ctx: &mut Context,
    generic: EntityId,
    args: Vec<Type>,
    location: &SourceLocation,
) -> Result<EntityId, CoreError> {
    let entity = ctx.entities.get(generic);
    let Some(def) = entity.as_object() else {
        return Err(CoreError::semantic(
            format!("`{}` is not an object type", entity.name),
            location,
        ));
    };
    check_arity(&entity.name, def.type_params.len(), args.len(), location)?;
    if let Some(instance) = cached(&def.instances, &args) {
        return Ok(instance);
    }

    let subst = bind_params(&def.type_params, &args);
    let instance_def = ObjectDef {
        scope: def.scope,
        type_params: Vec::new(),
        applied_args: args.clone(),
        generic_of: Some(generic),
        parent_expr: def.parent_expr.as_ref().map(|texpr| texpr.substitute(&subst)),
        field_exprs: def
            .field_exprs
            .iter()
            .map(|(name, texpr)| (name.clone(), texpr.substitute(&subst)))
            .collect(),
        parent: None,
        fields: Vec::new(),
        state: ResolveState::Pending,
        instances: Vec::new(),
        methods: Vec::new(),
    };
    let (name, decl_location) = (entity.name.clone(), entity.location.clone());

    enter(ctx, generic, &args, location)?;
    let instance = ctx
        .entities
        .alloc(name, decl_location, EntityKind::Object(instance_def));
    let resolved = resolve_object(ctx, instance);
    leave(ctx);
    resolved?;

    if let Some(def) = ctx.entities.object_mut(generic) {
        def.instances.push((args, instance));
    }
    tracing::debug!(instance = %ctx.entity_display_name(instance), "instantiated object");
    Ok(instance)
}

pub fn instantiate_fn(
    ctx: &mut Context,
    generic: EntityId,
    args: Vec<Type>,
    location: &SourceLocation,
) -> Result<EntityId, CoreError> {
    let entity = ctx.entities.get(generic);
    let Some(def) = entity.as_fn() else {
        return Err(CoreError::semantic(
            format!("`{}` is not a function", entity.name),
            location,
        ));
    };
    check_arity(&entity.name, def.type_params.len(), args.len(), location)?;
    if let Some(instance) = cached(&def.instances, &args) {
        return Ok(instance);
    }

    let subst = bind_params(&def.type_params, &args);
    let params: Vec<ParamDecl> = def
        .params
        .iter()
        .map(|param| ParamDecl {
            name: param.name.clone(),
            annotation: param.annotation.substitute(&subst),
            location: param.location.clone(),
        })
        .collect();
    let return_expr = def.return_expr.as_ref().map(|texpr| texpr.substitute(&subst));
    let (scope, body) = (def.scope, def.body.clone());
    let (name, decl_location) = (entity.name.clone(), entity.location.clone());

    enter(ctx, generic, &args, location)?;
    let body = match body {
        FnBody::Expr { first, root } => {
            let (first, root) = ctx.exprs.clone_range(first, root, &subst);
            FnBody::Expr { first, root }
        }
        other => other,
    };
    let mut instance_def = FnDef::new(scope, params, body);
    instance_def.applied_args = args.clone();
    instance_def.generic_of = Some(generic);
    instance_def.return_expr = return_expr;
    let instance = ctx
        .entities
        .alloc(name, decl_location, EntityKind::Fn(instance_def));

    let signature = resolve_signature(ctx, instance);
    ctx.instantiating.pop();
    if let Err(err) = signature {
        ctx.instance_depth -= 1;
        return Err(err);
    }
    if let Some(def) = ctx.entities.func_mut(generic) {
        def.instances.push((args, instance));
    }
    tracing::debug!(instance = %ctx.entity_display_name(instance), "instantiated function");

    // Cached before the body so recursive calls in the body hit the cache.
    let body = resolve_body(ctx, instance);
    ctx.instance_depth -= 1;
    body?;
    Ok(instance)
}

fn check_arity(
    name: &str,
    expected: usize,
    found: usize,
    location: &SourceLocation,
) -> Result<(), CoreError> {
    if expected == found {
        return Ok(());
    }
    Err(CoreError::InvalidGenericArgs {
        name: name.to_string(),
        expected,
        found,
        location: location.clone(),
    })
}

fn cached(instances: &[(Vec<Type>, EntityId)], args: &[Type]) -> Option<EntityId> {
    instances
        .iter()
        .find_map(|(key, instance)| (key.as_slice() == args).then_some(*instance))
}

fn bind_params(type_params: &[String], args: &[Type]) -> Vec<(String, Type)> {
    type_params.iter().cloned().zip(args.iter().cloned()).collect()
}

/// Marks `(generic, args)` as in flight.
fn enter(
    ctx: &mut Context,
    generic: EntityId,
    args: &[Type],
    location: &SourceLocation,
) -> Result<(), CoreError> {
    let in_flight = ctx
        .instantiating
        .iter()
        .any(|(entity, key)| *entity == generic && key.as_slice() == args);
    if in_flight || ctx.instance_depth >= MAX_INSTANTIATION_DEPTH {
        let args: Vec<String> = args.iter().map(|arg| ctx.type_name(arg)).collect();
        return Err(CoreError::CyclicInstantiation {
            name: format!("{}<{}>", ctx.entities.get(generic).name, args.join(", ")),
            location: location.clone(),
        });
    }
    ctx.instantiating.push((generic, args.to_vec()));
    ctx.instance_depth += 1;
    Ok(())
}

fn leave(ctx: &mut Context) {
    ctx.instantiating.pop();
    ctx.instance_depth -= 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::{declare_module, scan_module};
    use crate::parser::parse;
    use crate::resolve::resolve_program;
    use crate::scope::ScopeId;

    fn setup(source: &str) -> Result<(Context, ScopeId), CoreError> {
        let mut ctx = Context::new()?;
        let root = ctx.scopes.root();
        let (_, scope) = declare_module(&mut ctx, root, "src", SourceLocation::builtin())?;
        let forms = parse("test.vast", source)?;
        scan_module(&mut ctx, scope, &forms)?;
        resolve_program(&mut ctx)?;
        Ok((ctx, scope))
    }

    fn named(ctx: &Context, scope: ScopeId, name: &str) -> EntityId {
        ctx.scopes
            .resolve(&ctx.entities, scope, name)
            .or_else(|| ctx.scopes.resolve_overloads(&ctx.entities, scope, name).first().copied())
            .expect("declared")
    }

    const SHAPES: &str = "
        (obj Vec (: x i32) (: y i32))
        (obj Point (extends Vec) (: x i32) (: y i32) (: z i32))
        (obj Box (type_params T) (: value T))
    ";

    #[test]
    fn instantiation_is_idempotent() {
        let (mut ctx, scope) = setup(SHAPES).expect("setup");
        let generic = named(&ctx, scope, "Box");
        let loc = SourceLocation::builtin();
        let first = instantiate(&mut ctx, generic, vec![Type::I32], &loc).expect("first");
        let second = instantiate(&mut ctx, generic, vec![Type::I32], &loc).expect("second");
        assert_eq!(first, second);

        let other = instantiate(&mut ctx, generic, vec![Type::F64], &loc).expect("other");
        assert_ne!(first, other);
        assert_eq!(ctx.entity_display_name(other), "Box<f64>");
        let fields = &ctx.entities.object(other).expect("object").fields;
        assert_eq!(fields[0].ty, Type::F64);
    }

    #[test]
    fn instances_are_invariant_in_their_arguments() {
        let (mut ctx, scope) = setup(SHAPES).expect("setup");
        let generic = named(&ctx, scope, "Box");
        let vec = named(&ctx, scope, "Vec");
        let point = named(&ctx, scope, "Point");
        let loc = SourceLocation::builtin();
        let of_vec = instantiate(&mut ctx, generic, vec![Type::Object(vec)], &loc).expect("vec");
        let of_point =
            instantiate(&mut ctx, generic, vec![Type::Object(point)], &loc).expect("point");

        assert!(ctx.is_assignable(&Type::Object(point), &Type::Object(vec)));
        assert!(!ctx.is_assignable(&Type::Object(of_point), &Type::Object(of_vec)));
        assert!(!ctx.is_assignable(&Type::Object(of_vec), &Type::Object(of_point)));
        assert_eq!(
            ctx.entities.object(of_point).and_then(|def| def.parent),
            Some(ctx.builtins.object)
        );
    }

    #[test]
    fn instances_extend_the_declared_parent() {
        let (mut ctx, scope) = setup(
            "(obj Base (: id i32))
             (obj Tagged (type_params T) (extends Base) (: value T))",
        )
        .expect("setup");
        let generic = named(&ctx, scope, "Tagged");
        let base = named(&ctx, scope, "Base");
        let loc = SourceLocation::builtin();
        let instance = instantiate(&mut ctx, generic, vec![Type::I64], &loc).expect("instance");
        let def = ctx.entities.object(instance).expect("object");
        assert_eq!(def.parent, Some(base));
        assert_eq!(def.fields.len(), 2);
        assert!(ctx.is_assignable(&Type::Object(instance), &Type::Object(base)));
    }

    #[test]
    fn argument_count_must_match() {
        let (mut ctx, scope) = setup(SHAPES).expect("setup");
        let generic = named(&ctx, scope, "Box");
        let err = instantiate(
            &mut ctx,
            generic,
            vec![Type::I32, Type::I32],
            &SourceLocation::builtin(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidGenericArgs {
                expected: 1,
                found: 2,
                ..
            }
        ));

        let err = setup("(obj Box (type_params T) (: value T)) (fn f (parameters (: b Box)) 1)")
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidGenericArgs { .. }));
    }

    #[test]
    fn self_referential_instances_are_cyclic() {
        let err = setup(
            "(obj Node (type_params T) (: value T) (: next (Node T)))
             (fn f (parameters (: n (Node i32))) 1)",
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::CyclicInstantiation { .. }));
    }

    #[test]
    fn unbounded_instance_growth_is_cut_off() {
        let err = setup(
            "(obj Box (type_params T) (: value T))
             (obj Grow (type_params T) (: next (Grow (Box T))))
             (fn f (parameters (: g (Grow i32))) 1)",
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::CyclicInstantiation { .. }));
    }

    #[test]
    fn generic_functions_may_recurse() {
        let (ctx, scope) = setup(
            "(fn count (type_params T) (parameters (: v T) (: n i32)) (return_type i32)
               (if (< n 1) 0 (+ 1 (count v (- n 1)))))
             (fn main (parameters) (return_type i32) (count 1.5 3))",
        )
        .expect("setup");
        let count = named(&ctx, scope, "count");
        let instances = &ctx.entities.func(count).expect("fn").instances;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].0, vec![Type::F64]);
    }

    #[test]
    fn explicit_and_inferred_arguments_share_instances() {
        let (ctx, scope) = setup(
            "(fn id (type_params T) (parameters (: v T)) v)
             (fn a (parameters) (id 1))
             (fn b (parameters) (id (type_args i32) 2))",
        )
        .expect("setup");
        let id = named(&ctx, scope, "id");
        assert_eq!(ctx.entities.func(id).expect("fn").instances.len(), 1);
    }
}
