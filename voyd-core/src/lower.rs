//! Lowering of resolved HIR to the module builder.
//!
//! Every concrete object type becomes a GC struct whose field 0 holds a
//! reference to the type's constant ancestor-id array; subtypes are
//! declared as struct subtypes of their parent. Functions are lowered on
//! demand starting from the exports, so only reachable code (and only
//! instantiated generics) is emitted. Intrinsic calls are inlined.

use std::collections::{HashMap, VecDeque};

use crate::builder::{FieldDef, FuncImport, ModuleBuilder, NumType, Op, StructDef, ValueType};
use crate::builtins::Intrinsic;
use crate::context::Context;
use crate::entity::{EntityId, EntityKind, FnBody};
use crate::error::CoreError;
use crate::hir::{CallTarget, ExprId, HirExprKind, Literal};
use crate::inheritance::InheritanceEncoder;
use crate::span::SourceLocation;
use crate::types::{Prim, Type};

/// Lowers the functions in `exports` (and everything they reach).
#[tracing::instrument(level = "debug", skip_all, fields(exports = exports.len()))]
pub fn lower_program(
    ctx: &mut Context,
    exports: &[(String, EntityId)],
) -> Result<ModuleBuilder, CoreError> {
    let mut lowering = Lowering::new(ctx);
    lowering.declare_object_types()?;
    for (name, id) in exports {
        let index = lowering.func_index(*id)?;
        lowering.module.export_func(index, name.as_str());
    }
    while let Some(id) = lowering.queue.pop_front() {
        lowering.define_fn(id)?;
    }
    tracing::debug!(
        types = lowering.module.types.len(),
        funcs = lowering.module.funcs.len(),
        "lowered module"
    );
    Ok(lowering.module)
}

fn internal(message: impl Into<String>) -> CoreError {
    CoreError::semantic(message, &SourceLocation::builtin())
}

pub(crate) struct Lowering<'a> {
    pub(crate) ctx: &'a mut Context,
    pub(crate) module: ModuleBuilder,
    structs: HashMap<EntityId, u32>,
    chains: HashMap<EntityId, u32>,
    ids_array: Option<u32>,
    funcs: HashMap<EntityId, u32>,
    queue: VecDeque<EntityId>,
    pub(crate) extends_fn: Option<u32>,
    pub(crate) match_indexes: u32,
}

impl<'a> Lowering<'a> {
    fn new(ctx: &'a mut Context) -> Self {
        Lowering {
            ctx,
            module: ModuleBuilder::new(),
            structs: HashMap::new(),
            chains: HashMap::new(),
            ids_array: None,
            funcs: HashMap::new(),
            queue: VecDeque::new(),
            extends_fn: None,
            match_indexes: 0,
        }
    }

    /// Declares one struct per concrete object type, parents first, plus
    /// the global holding each type's ancestor chain.
    fn declare_object_types(&mut self) -> Result<(), CoreError> {
        let base = self.ctx.builtins.object;
        let mut objects: Vec<EntityId> = self
            .ctx
            .entities
            .concrete_objects()
            .map(|(id, _)| id)
            .collect();
        if objects.iter().all(|id| *id == base) {
            return Ok(());
        }
        let ids = self.module.array_type(ValueType::I32, false);
        self.ids_array = Some(ids);

        let mut chains = HashMap::new();
        for id in &objects {
            let chain = self.ctx.inheritance.ancestor_chain(&self.ctx.entities, *id);
            chains.insert(*id, chain);
        }
        objects.sort_by_key(|id| (chains[id].len(), *id));

        for id in &objects {
            let parent = self.ctx.entities.object(*id).and_then(|def| def.parent);
            let supertype = parent.and_then(|parent| self.structs.get(&parent).copied());
            let index = self.module.add_struct(StructDef {
                name: self.ctx.entity_display_name(*id),
                fields: Vec::new(),
                supertype,
            });
            self.structs.insert(*id, index);
        }

        for id in &objects {
            let layout = self
                .ctx
                .entities
                .object(*id)
                .map(|def| def.fields.clone())
                .unwrap_or_default();
            let mut fields = vec![FieldDef {
                name: "__ancestors".to_string(),
                ty: ValueType::Ref(ids),
                mutable: false,
            }];
            for field in layout {
                let ty = self.value_type(&field.ty)?.ok_or_else(|| {
                    internal(format!("field `{}` has no runtime representation", field.name))
                })?;
                fields.push(FieldDef {
                    name: field.name,
                    ty,
                    mutable: false,
                });
            }
            self.module.set_struct_fields(self.structs[id], fields);

            let values = chains[id]
                .iter()
                .map(|ancestor| Op::I32Const(InheritanceEncoder::runtime_id(*ancestor)))
                .collect();
            let global = self.module.add_global(
                format!("__chain_{}", self.ctx.entity_display_name(*id)),
                ValueType::Ref(ids),
                Op::ArrayNewFixed { ty: ids, values },
            );
            self.chains.insert(*id, global);
        }
        tracing::debug!(structs = objects.len(), "declared object types");
        Ok(())
    }

    /// Runtime representation of `ty`; `None` for types without values.
    pub(crate) fn value_type(&mut self, ty: &Type) -> Result<Option<ValueType>, CoreError> {
        Ok(match ty {
            Type::Prim(Prim::I32 | Prim::Bool) => Some(ValueType::I32),
            Type::Prim(Prim::I64) => Some(ValueType::I64),
            Type::Prim(Prim::F32) => Some(ValueType::F32),
            Type::Prim(Prim::F64) => Some(ValueType::F64),
            Type::Prim(Prim::Void) | Type::Never => None,
            Type::Object(id) => Some(ValueType::Ref(self.struct_index(*id)?)),
            Type::Array(elem) => Some(ValueType::Ref(self.array_index(elem)?)),
        })
    }

    pub(crate) fn struct_index(&self, object: EntityId) -> Result<u32, CoreError> {
        self.structs.get(&object).copied().ok_or_else(|| {
            internal(format!(
                "`{}` has no struct type",
                self.ctx.entity_display_name(object)
            ))
        })
    }

    pub(crate) fn chain_global(&self, object: EntityId) -> Result<u32, CoreError> {
        self.chains.get(&object).copied().ok_or_else(|| {
            internal(format!(
                "`{}` has no ancestor chain",
                self.ctx.entity_display_name(object)
            ))
        })
    }

    pub(crate) fn ids_array(&self) -> Result<u32, CoreError> {
        self.ids_array
            .ok_or_else(|| internal("ancestor arrays are only available with object types"))
    }

    pub(crate) fn array_index(&mut self, elem: &Type) -> Result<u32, CoreError> {
        let elem = self
            .value_type(elem)?
            .ok_or_else(|| internal("arrays need an element type with values"))?;
        Ok(self.module.array_type(elem, true))
    }

    /// Function index of `id`, declaring it and queueing its body on first
    /// use.
    fn func_index(&mut self, id: EntityId) -> Result<u32, CoreError> {
        if let Some(index) = self.funcs.get(&id) {
            return Ok(*index);
        }
        let def = self
            .ctx
            .entities
            .func(id)
            .ok_or_else(|| internal("call target is not a function"))?;
        let param_types = def.param_types.clone();
        let return_type = def.return_type.clone().unwrap_or(Type::VOID);
        let import = match &def.body {
            FnBody::Import { module, name } => Some(FuncImport {
                module: module.clone(),
                name: name.clone(),
            }),
            _ => None,
        };
        let mut params = Vec::with_capacity(param_types.len());
        for ty in &param_types {
            params.push(
                self.value_type(ty)?
                    .ok_or_else(|| internal("parameters need a value type"))?,
            );
        }
        let result = self.value_type(&return_type)?;
        let name = format!("{}_{}", self.ctx.entity_display_name(id), id.index());
        let index = match import {
            Some(import) => self.module.import_func(name, import, params, result),
            None => {
                let index = self.module.declare_func(name, params, result);
                self.queue.push_back(id);
                index
            }
        };
        self.funcs.insert(id, index);
        Ok(index)
    }

    fn define_fn(&mut self, id: EntityId) -> Result<(), CoreError> {
        let Some(def) = self.ctx.entities.func(id) else {
            return Ok(());
        };
        let FnBody::Expr { root, .. } = def.body else {
            return Ok(());
        };
        let param_vars = def.param_vars.clone();
        let returns_value = def.return_type.as_ref().is_some_and(Type::has_value);
        let index = self.func_index(id)?;

        let mut lowerer = FnLowerer::new(self, &param_vars);
        let body = lowerer.expr(root)?;
        let locals = std::mem::take(&mut lowerer.locals);
        let body_has_value = self.ctx.exprs.ty(root).has_value();
        let body = if body_has_value && !returns_value {
            vec![Op::Drop(Box::new(body))]
        } else {
            vec![body]
        };
        self.module.define_func(index, locals, body);
        Ok(())
    }
}

/// Lowers one function body.
pub(crate) struct FnLowerer<'l, 'a> {
    pub(crate) lowering: &'l mut Lowering<'a>,
    params: u32,
    pub(crate) locals: Vec<ValueType>,
    vars: HashMap<EntityId, u32>,
}

impl<'l, 'a> FnLowerer<'l, 'a> {
    fn new(lowering: &'l mut Lowering<'a>, params: &[EntityId]) -> Self {
        let vars = params
            .iter()
            .enumerate()
            .map(|(index, var)| (*var, index as u32))
            .collect();
        FnLowerer {
            lowering,
            params: params.len() as u32,
            locals: Vec::new(),
            vars,
        }
    }

    pub(crate) fn ctx(&self) -> &Context {
        &*self.lowering.ctx
    }

    /// Fresh local of type `ty`.
    pub(crate) fn local(&mut self, ty: ValueType) -> u32 {
        self.locals.push(ty);
        self.params + self.locals.len() as u32 - 1
    }

    /// Allocates the local backing variable entity `var`.
    pub(crate) fn bind_var(&mut self, var: EntityId) -> Result<u32, CoreError> {
        let ty = match &self.ctx().entities.get(var).kind {
            EntityKind::Variable(def) => def.ty.clone(),
            _ => return Err(internal("binding is not a variable")),
        };
        let ty = self
            .lowering
            .value_type(&ty)?
            .ok_or_else(|| internal("variables need a value type"))?;
        let local = self.local(ty);
        self.vars.insert(var, local);
        Ok(local)
    }

    fn var(&self, var: Option<EntityId>, location: &SourceLocation) -> Result<u32, CoreError> {
        var.and_then(|var| self.vars.get(&var).copied())
            .ok_or_else(|| CoreError::semantic("variable has no storage", location))
    }

    /// Lowers `id` to an op leaving the expression's value (if any) on the
    /// stack.
    pub(crate) fn expr(&mut self, id: ExprId) -> Result<Op, CoreError> {
        let expr = self.ctx().exprs.get(id);
        let kind = expr.kind.clone();
        let location = expr.location.clone();
        let ty = self.ctx().exprs.ty(id);

        match kind {
            HirExprKind::Literal(literal) => Ok(literal_op(literal)),
            HirExprKind::Ident { binding, .. } => Ok(Op::LocalGet(self.var(binding, &location)?)),
            HirExprKind::Block { body, .. } => {
                let last = body.len().saturating_sub(1);
                let mut ops = Vec::with_capacity(body.len());
                for (index, item) in body.into_iter().enumerate() {
                    let op = self.expr(item)?;
                    ops.push(self.discard_unless(index == last, item, op));
                }
                Ok(Op::Seq(ops))
            }
            HirExprKind::Let { init, entity, .. } => {
                let value = self.expr(init)?;
                let var = entity.ok_or_else(|| CoreError::semantic("unbound variable", &location))?;
                let local = self.bind_var(var)?;
                Ok(Op::LocalSet {
                    local,
                    value: Box::new(value),
                })
            }
            HirExprKind::Assign { value, target, .. } => {
                let local = self.var(target, &location)?;
                Ok(Op::LocalSet {
                    local,
                    value: Box::new(self.expr(value)?),
                })
            }
            HirExprKind::Call { args, target, .. } => match target {
                Some(CallTarget::Fn(callee)) => self.call(callee, &args, &location),
                Some(CallTarget::Construct(object)) => match args.as_slice() {
                    [literal] => self.construct(object, *literal, &location),
                    _ => Err(CoreError::semantic("constructor needs an object literal", &location)),
                },
                Some(CallTarget::Field { object, index }) => {
                    let [arg] = args.as_slice() else {
                        return Err(CoreError::semantic("field access takes one value", &location));
                    };
                    let value = self.expr(*arg)?;
                    Ok(Op::StructGet {
                        ty: self.lowering.struct_index(object)?,
                        field: index + 1,
                        object: Box::new(value),
                    })
                }
                None => Err(CoreError::semantic("call was not resolved", &location)),
            },
            HirExprKind::ObjectLiteral { .. } => Err(CoreError::semantic(
                "object literals are only valid as constructor arguments",
                &location,
            )),
            HirExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.expr(cond)?;
                let result = self.lowering.value_type(&ty)?;
                let then_op = self.expr(then_branch)?;
                let then_op = self.discard_unless(result.is_some(), then_branch, then_op);
                let else_body = match else_branch {
                    Some(branch) => {
                        let op = self.expr(branch)?;
                        vec![self.discard_unless(result.is_some(), branch, op)]
                    }
                    None => Vec::new(),
                };
                Ok(Op::If {
                    result,
                    cond: Box::new(cond),
                    then_body: vec![then_op],
                    else_body,
                })
            }
            HirExprKind::While { cond, body } => {
                let exit = self.lowering.module.fresh_label();
                let top = self.lowering.module.fresh_label();
                let cond = self.expr(cond)?;
                let body_op = self.expr(body)?;
                let body_op = self.discard_unless(false, body, body_op);
                Ok(Op::Block {
                    label: exit,
                    result: None,
                    body: vec![Op::Loop {
                        label: top,
                        body: vec![
                            Op::BrIf {
                                label: exit,
                                cond: Box::new(Op::Eqz {
                                    ty: NumType::I32,
                                    value: Box::new(cond),
                                }),
                            },
                            body_op,
                            Op::Br {
                                label: top,
                                value: None,
                            },
                        ],
                    }],
                })
            }
            HirExprKind::Match(m) => self.lower_match(&m, &ty, &location),
        }
    }

    /// Drops the value of `op` unless it is `keep`.
    pub(crate) fn discard_unless(&self, keep: bool, expr: ExprId, op: Op) -> Op {
        if !keep && self.ctx().exprs.ty(expr).has_value() {
            Op::Drop(Box::new(op))
        } else {
            op
        }
    }

    fn call(
        &mut self,
        callee: EntityId,
        args: &[ExprId],
        location: &SourceLocation,
    ) -> Result<Op, CoreError> {
        let mut ops = Vec::with_capacity(args.len());
        for arg in args {
            ops.push(self.expr(*arg)?);
        }
        let def = self
            .ctx()
            .entities
            .func(callee)
            .ok_or_else(|| CoreError::semantic("call target is not a function", location))?;
        match def.intrinsic() {
            Some(op) => {
                let elem = def.applied_args.first().cloned();
                self.intrinsic(op, elem, ops, location)
            }
            None => Ok(Op::Call {
                func: self.lowering.func_index(callee)?,
                args: ops,
            }),
        }
    }

    fn intrinsic(
        &mut self,
        op: Intrinsic,
        elem: Option<Type>,
        ops: Vec<Op>,
        location: &SourceLocation,
    ) -> Result<Op, CoreError> {
        let arity = || CoreError::semantic("intrinsic called with the wrong arity", location);
        Ok(match op {
            Intrinsic::Binary(kind, ty) => {
                let [left, right] = <[Op; 2]>::try_from(ops).map_err(|_| arity())?;
                Op::Binary {
                    op: kind,
                    ty,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            Intrinsic::Not => {
                let [value] = <[Op; 1]>::try_from(ops).map_err(|_| arity())?;
                Op::Eqz {
                    ty: NumType::I32,
                    value: Box::new(value),
                }
            }
            Intrinsic::NewArray => {
                let [len] = <[Op; 1]>::try_from(ops).map_err(|_| arity())?;
                Op::ArrayNewDefault {
                    ty: self.element_array(elem.as_ref(), location)?,
                    len: Box::new(len),
                }
            }
            Intrinsic::ArrayGet => {
                let [array, index] = <[Op; 2]>::try_from(ops).map_err(|_| arity())?;
                Op::ArrayGet {
                    ty: self.element_array(elem.as_ref(), location)?,
                    array: Box::new(array),
                    index: Box::new(index),
                }
            }
            Intrinsic::ArraySet => {
                let [array, index, value] = <[Op; 3]>::try_from(ops).map_err(|_| arity())?;
                Op::ArraySet {
                    ty: self.element_array(elem.as_ref(), location)?,
                    array: Box::new(array),
                    index: Box::new(index),
                    value: Box::new(value),
                }
            }
            Intrinsic::ArrayLen => {
                let [array] = <[Op; 1]>::try_from(ops).map_err(|_| arity())?;
                Op::ArrayLen(Box::new(array))
            }
        })
    }

    fn element_array(
        &mut self,
        elem: Option<&Type>,
        location: &SourceLocation,
    ) -> Result<u32, CoreError> {
        match elem {
            Some(elem) => self.lowering.array_index(elem),
            None => Err(CoreError::semantic("array intrinsic without element type", location)),
        }
    }

    /// `struct.new` with the ancestor chain first and the fields in layout
    /// order.
    fn construct(
        &mut self,
        object: EntityId,
        literal: ExprId,
        location: &SourceLocation,
    ) -> Result<Op, CoreError> {
        let HirExprKind::ObjectLiteral { fields } = self.ctx().exprs.get(literal).kind.clone()
        else {
            return Err(CoreError::semantic("constructor needs an object literal", location));
        };
        let layout = self
            .ctx()
            .entities
            .object(object)
            .map(|def| def.fields.clone())
            .unwrap_or_default();
        let mut values = vec![Op::GlobalGet(self.lowering.chain_global(object)?)];
        for slot in layout {
            let value = fields
                .iter()
                .find_map(|(name, value)| (*name == slot.name).then_some(*value))
                .ok_or_else(|| CoreError::UnresolvedIdentifier {
                    name: slot.name.clone(),
                    location: location.clone(),
                })?;
            values.push(self.expr(value)?);
        }
        Ok(Op::StructNew {
            ty: self.lowering.struct_index(object)?,
            fields: values,
        })
    }
}

pub(crate) fn literal_op(literal: Literal) -> Op {
    match literal {
        Literal::Int(value, Prim::I64) => Op::I64Const(value),
        Literal::Int(value, Prim::F32) => Op::F32Const(value as f32),
        Literal::Int(value, Prim::F64) => Op::F64Const(value as f64),
        Literal::Int(value, _) => Op::I32Const(value as i32),
        Literal::Float(value, Prim::F32) => Op::F32Const(value as f32),
        Literal::Float(value, _) => Op::F64Const(value),
        Literal::Bool(value) => Op::I32Const(i32::from(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TypeDef;
    use crate::init::{bind_imports, declare_module, scan_module};
    use crate::parser::parse;
    use crate::resolve::resolve_program;

    fn lower(source: &str, exports: &[&str]) -> Result<ModuleBuilder, CoreError> {
        let mut ctx = Context::new()?;
        let root = ctx.scopes.root();
        let (_, scope) = declare_module(&mut ctx, root, "src", SourceLocation::builtin())?;
        scan_module(&mut ctx, scope, &parse("test.vast", source)?)?;
        bind_imports(&mut ctx)?;
        resolve_program(&mut ctx)?;
        let exports: Vec<(String, EntityId)> = exports
            .iter()
            .map(|name| {
                let id = ctx.scopes.resolve_overloads(&ctx.entities, scope, name)[0];
                (name.to_string(), id)
            })
            .collect();
        lower_program(&mut ctx, &exports)
    }

    #[test]
    fn modules_without_objects_need_no_gc_types() {
        let module = lower(
            "(fn fib (parameters (: n i32)) (return_type i32)
               (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2)))))
             (fn main (parameters) (return_type i32) (fib 10))",
            &["main"],
        )
        .expect("lower");
        assert!(!module.uses_gc());
        assert_eq!(module.funcs.len(), 2);
        assert!(module.exported_func("main").is_some());
    }

    #[test]
    fn only_reachable_functions_are_emitted() {
        let module = lower(
            "(fn unused (parameters) (return_type i32) 1)
             (fn main (parameters) (return_type i32) 2)",
            &["main"],
        )
        .expect("lower");
        assert_eq!(module.funcs.len(), 1);
    }

    #[test]
    fn subtypes_extend_their_parent_struct() {
        let module = lower(
            "(obj Vec (: x i32) (: y i32))
             (obj Point (extends Vec) (: x i32) (: y i32) (: z i32))
             (fn main (parameters) (return_type i32)
               (z (Point (object (: x 1) (: y 2) (: z 3)))))",
            &["main"],
        )
        .expect("lower");
        assert!(module.uses_gc());
        let structs: Vec<(u32, &StructDef)> = module
            .types
            .iter()
            .enumerate()
            .filter_map(|(index, ty)| match ty {
                TypeDef::Struct(def) => Some((index as u32, def)),
                TypeDef::Array(_) => None,
            })
            .collect();
        let find = |name: &str| {
            structs
                .iter()
                .find(|(_, def)| def.name == name)
                .map(|(index, def)| (*index, *def))
                .expect("struct")
        };
        let (object, _) = find("Object");
        let (vec, vec_def) = find("Vec");
        let (point, point_def) = find("Point");
        assert_eq!(vec_def.supertype, Some(object));
        assert_eq!(point_def.supertype, Some(vec));
        assert!(module.is_subtype(point, object));
        let names: Vec<_> = point_def.fields.iter().map(|field| field.name.as_str()).collect();
        assert_eq!(names, ["__ancestors", "x", "y", "z"]);
        assert_eq!(module.globals.len(), 3);
    }

    #[test]
    fn void_functions_drop_their_body_value() {
        let module = lower(
            "(fn side (parameters) (return_type void) 5)
             (fn main (parameters) (return_type i32) (side) 1)",
            &["main"],
        )
        .expect("lower");
        let side = module
            .funcs
            .iter()
            .find(|func| func.name.starts_with("side"))
            .expect("side");
        assert_eq!(side.result, None);
        assert!(matches!(side.body.as_slice(), [Op::Drop(_)]));
    }
}
