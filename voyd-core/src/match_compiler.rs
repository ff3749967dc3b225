//! Lowering of `match` expressions.
//!
//! Literal matches compute a case index with a per-match helper function
//! and dispatch through `br_table` over nested blocks. Type-guard matches
//! test the scrutinee's ancestor chain for each case type in order and
//! cast it to the case type on a hit.
//!
//! Coverage of type-guard matches without a default is checked during
//! resolution; here their default arm is only an `unreachable` trap.

use crate::builder::{BinKind, LabelId, NumType, Op, ValueType};
use crate::builtins::num_type;
use crate::entity::EntityId;
use crate::error::CoreError;
use crate::hir::{ExprId, MatchCase, MatchExpr, Pattern};
use crate::inheritance::InheritanceEncoder;
use crate::lower::{FnLowerer, Lowering, literal_op};
use crate::span::SourceLocation;
use crate::types::{Prim, Type};

impl FnLowerer<'_, '_> {
    pub(crate) fn lower_match(
        &mut self,
        m: &MatchExpr,
        ty: &Type,
        location: &SourceLocation,
    ) -> Result<Op, CoreError> {
        let operand_ty = self.ctx().exprs.ty(m.operand);
        let scrutinee_ty = self
            .lowering
            .value_type(&operand_ty)?
            .ok_or_else(|| CoreError::semantic("match scrutinee has no value", location))?;
        let operand = self.expr(m.operand)?;
        let scrutinee = self.local(scrutinee_ty);
        let result = self.lowering.value_type(ty)?;
        let exit = self.lowering.module.fresh_label();

        let dispatch = if m.is_type_guard() {
            self.type_guard_dispatch(m, scrutinee, exit, result)?
        } else {
            self.literal_dispatch(m, scrutinee_ty, scrutinee, exit, result, location)?
        };
        Ok(Op::Seq(vec![
            Op::LocalSet {
                local: scrutinee,
                value: Box::new(operand),
            },
            dispatch,
        ]))
    }

    /// Body of an arm, rebinding the scrutinee first when the arm has a
    /// binding.
    fn arm(
        &mut self,
        binding: Option<EntityId>,
        bound_value: Op,
        body: ExprId,
        keep_value: bool,
    ) -> Result<Op, CoreError> {
        let mut ops = Vec::new();
        if let Some(var) = binding {
            let local = self.bind_var(var)?;
            ops.push(Op::LocalSet {
                local,
                value: Box::new(bound_value),
            });
        }
        let value = self.expr(body)?;
        ops.push(self.discard_unless(keep_value, body, value));
        Ok(Op::Seq(ops))
    }

    fn default_arm(
        &mut self,
        m: &MatchExpr,
        scrutinee: u32,
        result: Option<ValueType>,
    ) -> Result<Op, CoreError> {
        match m.default {
            Some(body) => self.arm(
                m.default_binding,
                Op::LocalGet(scrutinee),
                body,
                result.is_some(),
            ),
            None => Ok(Op::Unreachable),
        }
    }

    /// Leaves the match block with the arm's value.
    fn exit_with(exit: LabelId, arm: Op, result: Option<ValueType>) -> Op {
        match result {
            Some(_) => Op::Br {
                label: exit,
                value: Some(Box::new(arm)),
            },
            None => Op::Seq(vec![
                arm,
                Op::Br {
                    label: exit,
                    value: None,
                },
            ]),
        }
    }

    fn literal_dispatch(
        &mut self,
        m: &MatchExpr,
        scrutinee_ty: ValueType,
        scrutinee: u32,
        exit: LabelId,
        result: Option<ValueType>,
        location: &SourceLocation,
    ) -> Result<Op, CoreError> {
        let operand_prim = match self.ctx().exprs.ty(m.operand) {
            Type::Prim(prim) => prim,
            _ => return Err(CoreError::semantic("literal match on a non-primitive", location)),
        };
        let index_fn = self
            .lowering
            .match_index_fn(operand_prim, scrutinee_ty, &m.cases, location)?;

        let default_label = self.lowering.module.fresh_label();
        let case_labels: Vec<_> = m
            .cases
            .iter()
            .map(|_| self.lowering.module.fresh_label())
            .collect();
        let mut targets = vec![default_label];
        targets.extend(case_labels.iter().copied());

        let mut inner = vec![Op::Switch {
            targets,
            default: default_label,
            index: Box::new(Op::Call {
                func: index_fn,
                args: vec![Op::LocalGet(scrutinee)],
            }),
        }];
        for (case, label) in m.cases.iter().zip(case_labels) {
            let arm = self.arm(
                case.binding,
                Op::LocalGet(scrutinee),
                case.body,
                result.is_some(),
            )?;
            inner = vec![
                Op::Block {
                    label,
                    result: None,
                    body: inner,
                },
                Self::exit_with(exit, arm, result),
            ];
        }
        let default = self.default_arm(m, scrutinee, result)?;
        Ok(Op::Block {
            label: exit,
            result,
            body: vec![
                Op::Block {
                    label: default_label,
                    result: None,
                    body: inner,
                },
                default,
            ],
        })
    }

    fn type_guard_dispatch(
        &mut self,
        m: &MatchExpr,
        scrutinee: u32,
        exit: LabelId,
        result: Option<ValueType>,
    ) -> Result<Op, CoreError> {
        let extends = self.lowering.extends_fn()?;
        let base = self.lowering.struct_index(self.ctx().builtins.object)?;

        let mut body = Vec::with_capacity(m.cases.len() + 1);
        for case in &m.cases {
            let Some(Type::Object(case_object)) = case.pattern_ty.clone() else {
                return Err(CoreError::semantic("type pattern was not resolved", &case.location));
            };
            let case_struct = self.lowering.struct_index(case_object)?;
            let cast = Op::RefCast {
                ty: case_struct,
                value: Box::new(Op::LocalGet(scrutinee)),
            };
            let arm = self.arm(case.binding, cast, case.body, result.is_some())?;
            body.push(Op::If {
                result: None,
                cond: Box::new(Op::Call {
                    func: extends,
                    args: vec![
                        Op::I32Const(InheritanceEncoder::runtime_id(case_object)),
                        Op::StructGet {
                            ty: base,
                            field: 0,
                            object: Box::new(Op::LocalGet(scrutinee)),
                        },
                    ],
                }),
                then_body: vec![Self::exit_with(exit, arm, result)],
                else_body: Vec::new(),
            });
        }
        body.push(self.default_arm(m, scrutinee, result)?);
        Ok(Op::Block {
            label: exit,
            result,
            body,
        })
    }
}

impl Lowering<'_> {
    /// Helper returning 1 + the index of the first case whose literal
    /// equals the argument, or 0 when none does.
    fn match_index_fn(
        &mut self,
        prim: Prim,
        param: ValueType,
        cases: &[MatchCase],
        location: &SourceLocation,
    ) -> Result<u32, CoreError> {
        let num = num_type(prim)
            .ok_or_else(|| CoreError::semantic("literal match on a non-numeric value", location))?;
        let mut body = Vec::with_capacity(cases.len() + 1);
        for (index, case) in cases.iter().enumerate() {
            let Pattern::Literal(literal) = &case.pattern else {
                return Err(CoreError::InvalidPattern {
                    message: "type pattern in a literal match".into(),
                    location: case.location.clone(),
                });
            };
            body.push(Op::If {
                result: None,
                cond: Box::new(Op::Binary {
                    op: BinKind::Eq,
                    ty: num,
                    left: Box::new(Op::LocalGet(0)),
                    right: Box::new(literal_op(*literal)),
                }),
                then_body: vec![Op::Return(Some(Box::new(Op::I32Const(index as i32 + 1))))],
                else_body: Vec::new(),
            });
        }
        body.push(Op::I32Const(0));

        let name = format!("__match_index_{}", self.match_indexes);
        self.match_indexes += 1;
        let index = self
            .module
            .declare_func(name, vec![param], Some(ValueType::I32));
        self.module.define_func(index, Vec::new(), body);
        Ok(index)
    }

    /// `__extends(ancestor: i32, chain: ref $ids) -> i32`, emitted once.
    pub(crate) fn extends_fn(&mut self) -> Result<u32, CoreError> {
        if let Some(index) = self.extends_fn {
            return Ok(index);
        }
        let ids = self.ids_array()?;
        let (ancestor, chain, cursor) = (0, 1, 2);
        let exit = self.module.fresh_label();
        let top = self.module.fresh_label();
        let body = vec![
            Op::LocalSet {
                local: cursor,
                value: Box::new(Op::I32Const(0)),
            },
            Op::Block {
                label: exit,
                result: None,
                body: vec![Op::Loop {
                    label: top,
                    body: vec![
                        Op::BrIf {
                            label: exit,
                            cond: Box::new(Op::Binary {
                                op: BinKind::Ge,
                                ty: NumType::I32,
                                left: Box::new(Op::LocalGet(cursor)),
                                right: Box::new(Op::ArrayLen(Box::new(Op::LocalGet(chain)))),
                            }),
                        },
                        Op::If {
                            result: None,
                            cond: Box::new(Op::Binary {
                                op: BinKind::Eq,
                                ty: NumType::I32,
                                left: Box::new(Op::ArrayGet {
                                    ty: ids,
                                    array: Box::new(Op::LocalGet(chain)),
                                    index: Box::new(Op::LocalGet(cursor)),
                                }),
                                right: Box::new(Op::LocalGet(ancestor)),
                            }),
                            then_body: vec![Op::Return(Some(Box::new(Op::I32Const(1))))],
                            else_body: Vec::new(),
                        },
                        Op::LocalSet {
                            local: cursor,
                            value: Box::new(Op::Binary {
                                op: BinKind::Add,
                                ty: NumType::I32,
                                left: Box::new(Op::LocalGet(cursor)),
                                right: Box::new(Op::I32Const(1)),
                            }),
                        },
                        Op::Br {
                            label: top,
                            value: None,
                        },
                    ],
                }],
            },
            Op::I32Const(0),
        ];
        let index = self.module.declare_func(
            "__extends",
            vec![ValueType::I32, ValueType::Ref(ids)],
            Some(ValueType::I32),
        );
        self.module.define_func(index, vec![ValueType::I32], body);
        self.extends_fn = Some(index);
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::{ModuleBuilder, Op};
    use crate::context::Context;
    use crate::entity::EntityId;
    use crate::error::CoreError;
    use crate::init::{declare_module, scan_module};
    use crate::lower::lower_program;
    use crate::parser::parse;
    use crate::resolve::resolve_program;
    use crate::span::SourceLocation;

    const SHAPES: &str = "
        (obj Vec (: x i32) (: y i32))
        (obj Point (extends Vec) (: x i32) (: y i32) (: z i32))
        (obj Pointy (extends Vec) (: x i32) (: y i32) (: z i32))
    ";

    fn lower(source: &str) -> Result<ModuleBuilder, CoreError> {
        let mut ctx = Context::new()?;
        let root = ctx.scopes.root();
        let (_, scope) = declare_module(&mut ctx, root, "src", SourceLocation::builtin())?;
        scan_module(&mut ctx, scope, &parse("test.vast", &format!("{SHAPES}{source}"))?)?;
        resolve_program(&mut ctx)?;
        let main: EntityId = ctx.scopes.resolve_overloads(&ctx.entities, scope, "main")[0];
        lower_program(&mut ctx, &[("main".to_string(), main)])
    }

    #[test]
    fn literal_matches_use_an_index_helper_and_br_table() {
        let module = lower(
            "(fn main (parameters (: n i32)) (return_type i32)
               (match n (=> 1 10) (=> 2 20) (else 0)))",
        )
        .expect("lower");
        let helper = module
            .funcs
            .iter()
            .find(|func| func.name.starts_with("__match_index"))
            .expect("index helper");
        assert_eq!(helper.body.len(), 3);
        let wat = module.to_wat();
        assert!(wat.contains("br_table"));
    }

    #[test]
    fn type_guards_share_one_extends_helper() {
        let module = lower(
            "(fn which (parameters (: v Vec)) (return_type i32)
               (match v (=> Point 1) (=> Pointy 2) (else 0)))
             (fn other (parameters (: v Vec)) (return_type i32)
               (match v (=> Pointy 2) (else 0)))
             (fn main (parameters) (return_type i32)
               (+ (which (Point (object (: x 1) (: y 2) (: z 3))))
                  (other (Vec (object (: x 1) (: y 2))))))",
        )
        .expect("lower");
        let helpers = module
            .funcs
            .iter()
            .filter(|func| func.name == "__extends")
            .count();
        assert_eq!(helpers, 1);
    }

    #[test]
    fn missing_subtypes_make_a_match_non_exhaustive() {
        let err = lower(
            "(fn which (parameters (: v Vec)) (return_type i32)
               (match v (=> Point 1) (=> Pointy 2)))
             (fn main (parameters) (return_type i32)
               (which (Point (object (: x 1) (: y 2) (: z 3)))))",
        )
        .unwrap_err();
        match err {
            CoreError::NonExhaustiveMatch { missing, .. } => assert_eq!(missing, ["Vec"]),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn covering_every_subtype_needs_no_default() {
        let module = lower(
            "(fn which (parameters (: v Vec)) (return_type i32)
               (match v (=> Point 1) (=> Vec 2)))
             (fn main (parameters) (return_type i32)
               (which (Point (object (: x 1) (: y 2) (: z 3)))))",
        )
        .expect("lower");
        let which = module
            .funcs
            .iter()
            .find(|func| func.name.starts_with("which"))
            .expect("which");
        let Op::Seq(ops) = &which.body[0] else {
            panic!("expected a sequence");
        };
        let Some(Op::Block { body, .. }) = ops.last() else {
            panic!("expected the dispatch block");
        };
        assert!(matches!(body.last(), Some(Op::Unreachable)));
    }
}
