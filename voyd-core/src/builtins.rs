//! Compiler-provided entities visible from every module.
//!
//! The root scope binds the primitive type names, the implicit base type
//! `Object`, the generic `FixedArray<T>`, and a set of intrinsic
//! functions. Intrinsics are ordinary overloadable function entities
//! whose body is a single machine operation; lowering inlines them at
//! each call site.

use crate::builder::{BinKind, NumType};
use crate::entity::{
    EntityId, EntityKind, EntityTable, FnBody, FnDef, ObjectDef, ParamDecl, ResolveState,
};
use crate::error::CoreError;
use crate::hir::TypeExpr;
use crate::scope::{ScopeId, ScopeTable};
use crate::span::SourceLocation;
use crate::types::{Prim, Type};

pub const OBJECT_TYPE: &str = "Object";
pub const ARRAY_TYPE: &str = "FixedArray";

/// Operation an intrinsic function lowers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Binary(BinKind, NumType),
    Not,
    NewArray,
    ArrayGet,
    ArraySet,
    ArrayLen,
}

/// Metadata about an operator intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorDescriptor {
    pub name: &'static str,
    pub kind: BinKind,
    /// Operand types the operator is defined for.
    pub operands: &'static [Prim],
}

const NUMERIC: &[Prim] = &[Prim::I32, Prim::I64, Prim::F32, Prim::F64];
const INTEGER: &[Prim] = &[Prim::I32, Prim::I64];
const EQUATABLE: &[Prim] = &[Prim::I32, Prim::I64, Prim::F32, Prim::F64, Prim::Bool];

/// Every binary operator the core knows about.
pub const OPERATORS: &[OperatorDescriptor] = &[
    OperatorDescriptor { name: "+", kind: BinKind::Add, operands: NUMERIC },
    OperatorDescriptor { name: "-", kind: BinKind::Sub, operands: NUMERIC },
    OperatorDescriptor { name: "*", kind: BinKind::Mul, operands: NUMERIC },
    OperatorDescriptor { name: "/", kind: BinKind::Div, operands: NUMERIC },
    OperatorDescriptor { name: "%", kind: BinKind::Rem, operands: INTEGER },
    OperatorDescriptor { name: "<", kind: BinKind::Lt, operands: NUMERIC },
    OperatorDescriptor { name: ">", kind: BinKind::Gt, operands: NUMERIC },
    OperatorDescriptor { name: "<=", kind: BinKind::Le, operands: NUMERIC },
    OperatorDescriptor { name: ">=", kind: BinKind::Ge, operands: NUMERIC },
    OperatorDescriptor { name: "==", kind: BinKind::Eq, operands: EQUATABLE },
    OperatorDescriptor { name: "!=", kind: BinKind::Ne, operands: EQUATABLE },
    OperatorDescriptor { name: "and", kind: BinKind::And, operands: &[Prim::Bool] },
    OperatorDescriptor { name: "or", kind: BinKind::Or, operands: &[Prim::Bool] },
];

/// Look up an operator by its source-level name.
pub fn find_operator(name: &str) -> Option<&'static OperatorDescriptor> {
    OPERATORS.iter().find(|op| op.name == name)
}

/// Machine representation of a primitive operand. Booleans are `i32`.
pub fn num_type(prim: Prim) -> Option<NumType> {
    match prim {
        Prim::I32 | Prim::Bool => Some(NumType::I32),
        Prim::I64 => Some(NumType::I64),
        Prim::F32 => Some(NumType::F32),
        Prim::F64 => Some(NumType::F64),
        Prim::Void => None,
    }
}

/// Entities registered in the root scope that the compiler refers to.
#[derive(Debug, Clone, Copy)]
pub struct Builtins {
    pub object: EntityId,
    pub fixed_array: EntityId,
}

pub fn register_builtins(
    entities: &mut EntityTable,
    scopes: &mut ScopeTable,
) -> Result<Builtins, CoreError> {
    let root = scopes.root();

    for prim in Prim::ALL {
        let id = entities.alloc(
            prim.name(),
            SourceLocation::builtin(),
            EntityKind::Primitive(prim),
        );
        scopes.register(entities, root, id)?;
    }

    let object = entities.alloc(
        OBJECT_TYPE,
        SourceLocation::builtin(),
        EntityKind::Object(ObjectDef {
            scope: root,
            type_params: Vec::new(),
            applied_args: Vec::new(),
            generic_of: None,
            parent_expr: None,
            field_exprs: Vec::new(),
            parent: None,
            fields: Vec::new(),
            state: ResolveState::Done,
            instances: Vec::new(),
            methods: Vec::new(),
        }),
    );
    scopes.register(entities, root, object)?;

    let fixed_array = entities.alloc(ARRAY_TYPE, SourceLocation::builtin(), EntityKind::ArrayType);
    scopes.register(entities, root, fixed_array)?;

    for op in OPERATORS {
        for prim in op.operands {
            let Some(num) = num_type(*prim) else {
                continue;
            };
            let operand = TypeExpr::Resolved(Type::Prim(*prim));
            let result = if op.kind.is_comparison() {
                Type::BOOL
            } else {
                Type::Prim(*prim)
            };
            register_intrinsic(
                entities,
                scopes,
                op.name,
                &[],
                &[("left", operand.clone()), ("right", operand)],
                TypeExpr::Resolved(result),
                Intrinsic::Binary(op.kind, num),
            )?;
        }
    }

    register_intrinsic(
        entities,
        scopes,
        "not",
        &[],
        &[("value", TypeExpr::Resolved(Type::BOOL))],
        TypeExpr::Resolved(Type::BOOL),
        Intrinsic::Not,
    )?;

    let elem = || TypeExpr::named("T", SourceLocation::builtin());
    let array = || TypeExpr::Apply {
        name: ARRAY_TYPE.to_string(),
        args: vec![elem()],
        location: SourceLocation::builtin(),
    };
    let index = || TypeExpr::Resolved(Type::I32);

    register_intrinsic(
        entities,
        scopes,
        "new_array",
        &["T"],
        &[("size", index())],
        array(),
        Intrinsic::NewArray,
    )?;
    register_intrinsic(
        entities,
        scopes,
        "array_get",
        &["T"],
        &[("array", array()), ("index", index())],
        elem(),
        Intrinsic::ArrayGet,
    )?;
    register_intrinsic(
        entities,
        scopes,
        "array_set",
        &["T"],
        &[("array", array()), ("index", index()), ("value", elem())],
        TypeExpr::Resolved(Type::VOID),
        Intrinsic::ArraySet,
    )?;
    register_intrinsic(
        entities,
        scopes,
        "array_len",
        &["T"],
        &[("array", array())],
        TypeExpr::Resolved(Type::I32),
        Intrinsic::ArrayLen,
    )?;

    Ok(Builtins {
        object,
        fixed_array,
    })
}

fn register_intrinsic(
    entities: &mut EntityTable,
    scopes: &mut ScopeTable,
    name: &str,
    type_params: &[&str],
    params: &[(&str, TypeExpr)],
    result: TypeExpr,
    op: Intrinsic,
) -> Result<EntityId, CoreError> {
    let root: ScopeId = scopes.root();
    let params = params
        .iter()
        .map(|(param, annotation)| ParamDecl {
            name: param.to_string(),
            annotation: annotation.clone(),
            location: SourceLocation::builtin(),
        })
        .collect();
    let mut def = FnDef::new(root, params, FnBody::Intrinsic(op));
    def.type_params = type_params.iter().map(|param| param.to_string()).collect();
    def.return_expr = Some(result);
    let id = entities.alloc(name, SourceLocation::builtin(), EntityKind::Fn(def));
    scopes.register(entities, root, id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_operator_overloads_in_the_root_scope() {
        let mut entities = EntityTable::new();
        let mut scopes = ScopeTable::new();
        register_builtins(&mut entities, &mut scopes).expect("builtins");
        let root = scopes.root();

        let plus = scopes.resolve_overloads(&entities, root, "+");
        assert_eq!(plus.len(), 4);
        let rem = scopes.resolve_overloads(&entities, root, "%");
        assert_eq!(rem.len(), 2);
        let eq = scopes.resolve_overloads(&entities, root, "==");
        assert_eq!(eq.len(), 5);

        assert!(scopes.resolve(&entities, root, "Object").is_some());
        assert!(scopes.resolve(&entities, root, "i32").is_some());
    }

    #[test]
    fn finds_operators_by_name() {
        let descriptor = find_operator("<=").expect("known operator");
        assert_eq!(descriptor.kind, BinKind::Le);
        assert!(find_operator("**").is_none());
    }
}
