//! Reference evaluator for module-builder modules.
//!
//! Executes the folded op tree directly, with heap objects behind
//! `Rc<RefCell<_>>`. Used to run GC modules, which the embedded `wasmi`
//! engine cannot execute, and as an oracle in tests. Traps follow wasm
//! semantics: division by zero, failed casts and out-of-bounds array
//! accesses abort the call. Imported functions call host closures
//! registered with `Evaluator::with_host`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::builder::{BinKind, LabelId, ModuleBuilder, NumType, Op, TypeDef, ValueType};

/// Calls nested deeper than this trap with `EvalError::CallStackExhausted`.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("no exported function named `{0}`")]
    UnknownExport(String),
    #[error("no host function provided for import `{module}.{name}`")]
    UnknownImport { module: String, name: String },
    #[error("`{name}` expects {expected} argument(s) but {found} were given")]
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("unreachable executed")]
    Unreachable,
    #[error("null reference")]
    NullReference,
    #[error("cast to type {0} failed")]
    CastFailure(u32),
    #[error("array index {index} out of bounds for length {len}")]
    OutOfBounds { index: i64, len: usize },
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("malformed module: {0}")]
    Malformed(String),
}

fn malformed(message: impl Into<String>) -> EvalError {
    EvalError::Malformed(message.into())
}

#[derive(Debug)]
pub enum HeapObject {
    Struct { ty: u32, fields: Vec<Value> },
    Array { ty: u32, elements: Vec<Value> },
}

pub type HeapRef = Rc<RefCell<HeapObject>>;

#[derive(Debug, Clone)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(Option<HeapRef>),
}

impl Value {
    /// Zero value of a local or array element.
    pub fn default_for(ty: ValueType) -> Value {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
            ValueType::Ref(_) => Value::Ref(None),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(value) => Some(*value),
            _ => None,
        }
    }

    fn heap(&self) -> Result<HeapRef, EvalError> {
        match self {
            Value::Ref(Some(object)) => Ok(Rc::clone(object)),
            Value::Ref(None) => Err(EvalError::NullReference),
            other => Err(malformed(format!("expected a reference, found {other}"))),
        }
    }

    fn index(&self) -> Result<i32, EvalError> {
        self.as_i32()
            .ok_or_else(|| malformed(format!("expected an i32, found {self}")))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::I32(i32::from(value))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(value) => write!(f, "{value}"),
            Value::I64(value) => write!(f, "{value}"),
            Value::F32(value) => write!(f, "{value}"),
            Value::F64(value) => write!(f, "{value}"),
            Value::Ref(None) => write!(f, "null"),
            Value::Ref(Some(object)) => match &*object.borrow() {
                HeapObject::Struct { ty, .. } => write!(f, "<struct {ty}>"),
                HeapObject::Array { elements, .. } => write!(f, "<array[{}]>", elements.len()),
            },
        }
    }
}

/// How evaluation of an op ended.
enum Flow {
    Value(Option<Value>),
    Break(LabelId, Option<Value>),
    Return(Option<Value>),
}

/// Evaluates an operand, passing branches and returns through.
macro_rules! operand {
    ($self:ident, $locals:ident, $op:expr) => {
        match $self.eval($locals, $op)? {
            Flow::Value(Some(value)) => value,
            Flow::Value(None) => return Err(malformed("operand produced no value")),
            flow => return Ok(flow),
        }
    };
}

/// Host implementation of an imported function.
pub type HostFn = Box<dyn FnMut(&[Value]) -> Result<Option<Value>, EvalError>>;

pub struct Evaluator<'m> {
    module: &'m ModuleBuilder,
    hosts: HashMap<(String, String), HostFn>,
    globals: Vec<Value>,
    depth: usize,
    max_depth: usize,
}

impl<'m> Evaluator<'m> {
    /// Prepares `module` for execution, evaluating its global initializers.
    pub fn new(module: &'m ModuleBuilder) -> Result<Self, EvalError> {
        let mut evaluator = Evaluator {
            module,
            hosts: HashMap::new(),
            globals: Vec::with_capacity(module.globals.len()),
            depth: 0,
            max_depth: DEFAULT_MAX_CALL_DEPTH,
        };
        for global in &module.globals {
            let mut locals = Vec::new();
            match evaluator.eval(&mut locals, &global.init)? {
                Flow::Value(Some(value)) => evaluator.globals.push(value),
                _ => return Err(malformed(format!("global `{}` has no value", global.name))),
            }
        }
        Ok(evaluator)
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Supplies the function imported as `module.name`.
    pub fn with_host(
        mut self,
        module: &str,
        name: &str,
        host: impl FnMut(&[Value]) -> Result<Option<Value>, EvalError> + 'static,
    ) -> Self {
        self.hosts
            .insert((module.to_string(), name.to_string()), Box::new(host));
        self
    }

    /// Calls the function exported as `name`.
    pub fn call_export(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
        let (index, _) = self
            .module
            .exported_func(name)
            .ok_or_else(|| EvalError::UnknownExport(name.to_string()))?;
        self.call(index, args.to_vec())
    }

    pub fn call(&mut self, func: u32, args: Vec<Value>) -> Result<Option<Value>, EvalError> {
        let module = self.module;
        let def = module
            .funcs
            .get(func as usize)
            .ok_or_else(|| malformed(format!("no function {func}")))?;
        if args.len() != def.params.len() {
            return Err(EvalError::ArgumentCount {
                name: def.name.clone(),
                expected: def.params.len(),
                found: args.len(),
            });
        }
        if let Some(import) = &def.import {
            let host = self
                .hosts
                .get_mut(&(import.module.clone(), import.name.clone()))
                .ok_or_else(|| EvalError::UnknownImport {
                    module: import.module.clone(),
                    name: import.name.clone(),
                })?;
            return host(&args);
        }
        if self.depth >= self.max_depth {
            return Err(EvalError::CallStackExhausted);
        }
        let mut locals = args;
        locals.extend(def.locals.iter().map(|ty| Value::default_for(*ty)));

        self.depth += 1;
        let result = self.body(&mut locals, &def.body);
        self.depth -= 1;
        match result? {
            Flow::Value(value) | Flow::Return(value) => Ok(value.filter(|_| def.result.is_some())),
            Flow::Break(label, _) => Err(malformed(format!(
                "branch to label {} escaped `{}`",
                label.index(),
                def.name
            ))),
        }
    }

    /// Evaluates `ops` in order; the last op provides the value.
    fn body(&mut self, locals: &mut Vec<Value>, ops: &[Op]) -> Result<Flow, EvalError> {
        let mut last = None;
        for op in ops {
            match self.eval(locals, op)? {
                Flow::Value(value) => last = value,
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Value(last))
    }

    fn eval(&mut self, locals: &mut Vec<Value>, op: &Op) -> Result<Flow, EvalError> {
        let value = match op {
            Op::I32Const(value) => Value::I32(*value),
            Op::I64Const(value) => Value::I64(*value),
            Op::F32Const(value) => Value::F32(*value),
            Op::F64Const(value) => Value::F64(*value),
            Op::LocalGet(local) => locals
                .get(*local as usize)
                .cloned()
                .ok_or_else(|| malformed(format!("no local {local}")))?,
            Op::LocalSet { local, value } => {
                let value = operand!(self, locals, value);
                let slot = locals
                    .get_mut(*local as usize)
                    .ok_or_else(|| malformed(format!("no local {local}")))?;
                *slot = value;
                return Ok(Flow::Value(None));
            }
            Op::GlobalGet(global) => self
                .globals
                .get(*global as usize)
                .cloned()
                .ok_or_else(|| malformed(format!("no global {global}")))?,
            Op::Binary {
                op,
                ty,
                left,
                right,
            } => {
                let left = operand!(self, locals, left);
                let right = operand!(self, locals, right);
                binary(*op, *ty, left, right)?
            }
            Op::Eqz { value, .. } => match operand!(self, locals, value) {
                Value::I32(value) => Value::from(value == 0),
                Value::I64(value) => Value::from(value == 0),
                other => return Err(malformed(format!("eqz on {other}"))),
            },
            Op::Call { func, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(operand!(self, locals, arg));
                }
                return Ok(Flow::Value(self.call(*func, values)?));
            }
            Op::Block { label, body, .. } => {
                return match self.body(locals, body)? {
                    Flow::Break(target, value) if target == *label => Ok(Flow::Value(value)),
                    flow => Ok(flow),
                };
            }
            Op::Loop { label, body } => loop {
                match self.body(locals, body)? {
                    Flow::Break(target, _) if target == *label => continue,
                    flow => return Ok(flow),
                }
            },
            Op::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                let cond = operand!(self, locals, cond).index()?;
                let branch = if cond != 0 { then_body } else { else_body };
                return self.body(locals, branch);
            }
            Op::Br { label, value } => {
                let value = match value {
                    Some(value) => Some(operand!(self, locals, value)),
                    None => None,
                };
                return Ok(Flow::Break(*label, value));
            }
            Op::BrIf { label, cond } => {
                let cond = operand!(self, locals, cond).index()?;
                if cond != 0 {
                    return Ok(Flow::Break(*label, None));
                }
                return Ok(Flow::Value(None));
            }
            Op::Switch {
                targets,
                default,
                index,
            } => {
                let index = operand!(self, locals, index).index()?;
                let target = usize::try_from(index)
                    .ok()
                    .and_then(|index| targets.get(index))
                    .unwrap_or(default);
                return Ok(Flow::Break(*target, None));
            }
            Op::Return(value) => {
                let value = match value {
                    Some(value) => Some(operand!(self, locals, value)),
                    None => None,
                };
                return Ok(Flow::Return(value));
            }
            Op::Drop(value) => {
                return match self.eval(locals, value)? {
                    Flow::Value(_) => Ok(Flow::Value(None)),
                    flow => Ok(flow),
                };
            }
            Op::Seq(ops) => return self.body(locals, ops),
            Op::Unreachable => return Err(EvalError::Unreachable),
            Op::StructNew { ty, fields } => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(operand!(self, locals, field));
                }
                Value::Ref(Some(Rc::new(RefCell::new(HeapObject::Struct {
                    ty: *ty,
                    fields: values,
                }))))
            }
            Op::StructGet { field, object, .. } => {
                let object = operand!(self, locals, object).heap()?;
                let object = object.borrow();
                match &*object {
                    HeapObject::Struct { fields, .. } => fields
                        .get(*field as usize)
                        .cloned()
                        .ok_or_else(|| malformed(format!("no field {field}")))?,
                    HeapObject::Array { .. } => return Err(malformed("struct.get on an array")),
                }
            }
            Op::RefCast { ty, value } => {
                let value = operand!(self, locals, value);
                if let Value::Ref(Some(object)) = &value {
                    let actual = match &*object.borrow() {
                        HeapObject::Struct { ty, .. } | HeapObject::Array { ty, .. } => *ty,
                    };
                    if !self.module.is_subtype(actual, *ty) {
                        return Err(EvalError::CastFailure(*ty));
                    }
                }
                value
            }
            Op::ArrayNewFixed { ty, values } => {
                let mut elements = Vec::with_capacity(values.len());
                for value in values {
                    elements.push(operand!(self, locals, value));
                }
                Value::Ref(Some(Rc::new(RefCell::new(HeapObject::Array {
                    ty: *ty,
                    elements,
                }))))
            }
            Op::ArrayNewDefault { ty, len } => {
                let len = operand!(self, locals, len).index()?;
                let len = usize::try_from(len).map_err(|_| EvalError::OutOfBounds {
                    index: i64::from(len),
                    len: 0,
                })?;
                let element = match self.module.types.get(*ty as usize) {
                    Some(TypeDef::Array(def)) => def.element,
                    _ => return Err(malformed(format!("type {ty} is not an array"))),
                };
                Value::Ref(Some(Rc::new(RefCell::new(HeapObject::Array {
                    ty: *ty,
                    elements: vec![Value::default_for(element); len],
                }))))
            }
            Op::ArrayGet { array, index, .. } => {
                let array = operand!(self, locals, array).heap()?;
                let index = operand!(self, locals, index).index()?;
                let array = array.borrow();
                let elements = array_elements(&array)?;
                let slot = checked_index(index, elements.len())?;
                elements[slot].clone()
            }
            Op::ArraySet {
                array,
                index,
                value,
                ..
            } => {
                let array = operand!(self, locals, array).heap()?;
                let index = operand!(self, locals, index).index()?;
                let value = operand!(self, locals, value);
                let mut array = array.borrow_mut();
                let HeapObject::Array { elements, .. } = &mut *array else {
                    return Err(malformed("array.set on a struct"));
                };
                let slot = checked_index(index, elements.len())?;
                elements[slot] = value;
                return Ok(Flow::Value(None));
            }
            Op::ArrayLen(array) => {
                let array = operand!(self, locals, array).heap()?;
                let len = array_elements(&array.borrow())?.len();
                Value::I32(i32::try_from(len).map_err(|_| EvalError::IntegerOverflow)?)
            }
        };
        Ok(Flow::Value(Some(value)))
    }
}

fn array_elements(object: &HeapObject) -> Result<&[Value], EvalError> {
    match object {
        HeapObject::Array { elements, .. } => Ok(elements),
        HeapObject::Struct { .. } => Err(malformed("array access on a struct")),
    }
}

fn checked_index(index: i32, len: usize) -> Result<usize, EvalError> {
    usize::try_from(index)
        .ok()
        .filter(|slot| *slot < len)
        .ok_or(EvalError::OutOfBounds {
            index: i64::from(index),
            len,
        })
}

macro_rules! int_binary {
    ($op:expr, $a:expr, $b:expr, $wrap:path) => {{
        let (a, b) = ($a, $b);
        match $op {
            BinKind::Add => $wrap(a.wrapping_add(b)),
            BinKind::Sub => $wrap(a.wrapping_sub(b)),
            BinKind::Mul => $wrap(a.wrapping_mul(b)),
            BinKind::Div if b == 0 => return Err(EvalError::DivisionByZero),
            BinKind::Div => $wrap(a.checked_div(b).ok_or(EvalError::IntegerOverflow)?),
            BinKind::Rem if b == 0 => return Err(EvalError::DivisionByZero),
            BinKind::Rem => $wrap(a.wrapping_rem(b)),
            BinKind::Eq => Value::from(a == b),
            BinKind::Ne => Value::from(a != b),
            BinKind::Lt => Value::from(a < b),
            BinKind::Gt => Value::from(a > b),
            BinKind::Le => Value::from(a <= b),
            BinKind::Ge => Value::from(a >= b),
            BinKind::And => $wrap(a & b),
            BinKind::Or => $wrap(a | b),
        }
    }};
}

macro_rules! float_binary {
    ($op:expr, $a:expr, $b:expr, $wrap:path) => {{
        let (a, b) = ($a, $b);
        match $op {
            BinKind::Add => $wrap(a + b),
            BinKind::Sub => $wrap(a - b),
            BinKind::Mul => $wrap(a * b),
            BinKind::Div => $wrap(a / b),
            BinKind::Eq => Value::from(a == b),
            BinKind::Ne => Value::from(a != b),
            BinKind::Lt => Value::from(a < b),
            BinKind::Gt => Value::from(a > b),
            BinKind::Le => Value::from(a <= b),
            BinKind::Ge => Value::from(a >= b),
            BinKind::Rem | BinKind::And | BinKind::Or => {
                return Err(malformed(format!("`{}` on floats", $op.name())));
            }
        }
    }};
}

fn binary(op: BinKind, ty: NumType, left: Value, right: Value) -> Result<Value, EvalError> {
    Ok(match (ty, left, right) {
        (NumType::I32, Value::I32(a), Value::I32(b)) => int_binary!(op, a, b, Value::I32),
        (NumType::I64, Value::I64(a), Value::I64(b)) => int_binary!(op, a, b, Value::I64),
        (NumType::F32, Value::F32(a), Value::F32(b)) => float_binary!(op, a, b, Value::F32),
        (NumType::F64, Value::F64(a), Value::F64(b)) => float_binary!(op, a, b, Value::F64),
        (ty, left, right) => {
            return Err(malformed(format!(
                "`{}` on {ty:?} applied to {left} and {right}",
                op.name()
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FieldDef, FuncImport, StructDef};

    fn call(module: &ModuleBuilder, name: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
        Evaluator::new(module)?.call_export(name, args)
    }

    fn single(body: Op, result: Option<ValueType>) -> ModuleBuilder {
        let mut module = ModuleBuilder::new();
        let index = module.declare_func("f", Vec::new(), result);
        module.define_func(index, Vec::new(), vec![body]);
        module.export_func(index, "f");
        module
    }

    #[test]
    fn switch_branches_to_the_selected_block() {
        // block $exit (result i32)
        //   block $default  block $one  br_table [$default $one] $default (local 0)
        //   end  i32.const 10 br $exit
        //   end  i32.const 0
        let mut module = ModuleBuilder::new();
        let index = module.declare_func("pick", vec![ValueType::I32], Some(ValueType::I32));
        let (exit, default, one) = (
            module.fresh_label(),
            module.fresh_label(),
            module.fresh_label(),
        );
        let body = Op::Block {
            label: exit,
            result: Some(ValueType::I32),
            body: vec![
                Op::Block {
                    label: default,
                    result: None,
                    body: vec![
                        Op::Block {
                            label: one,
                            result: None,
                            body: vec![Op::Switch {
                                targets: vec![default, one],
                                default,
                                index: Box::new(Op::LocalGet(0)),
                            }],
                        },
                        Op::Br {
                            label: exit,
                            value: Some(Box::new(Op::I32Const(10))),
                        },
                    ],
                },
                Op::I32Const(0),
            ],
        };
        module.define_func(index, Vec::new(), vec![body]);
        module.export_func(index, "pick");

        let pick = |n| {
            call(&module, "pick", &[Value::I32(n)])
                .expect("call")
                .and_then(|value| value.as_i32())
        };
        assert_eq!(pick(1), Some(10));
        assert_eq!(pick(0), Some(0));
        assert_eq!(pick(7), Some(0));
    }

    #[test]
    fn integer_division_by_zero_traps() {
        let module = single(
            Op::Binary {
                op: BinKind::Div,
                ty: NumType::I32,
                left: Box::new(Op::I32Const(1)),
                right: Box::new(Op::I32Const(0)),
            },
            Some(ValueType::I32),
        );
        let err = call(&module, "f", &[]).unwrap_err();
        assert!(matches!(err, EvalError::DivisionByZero));
    }

    #[test]
    fn array_accesses_are_bounds_checked() {
        let mut module = ModuleBuilder::new();
        let array = module.array_type(ValueType::F64, true);
        let index = module.declare_func("f", Vec::new(), Some(ValueType::F64));
        module.define_func(
            index,
            Vec::new(),
            vec![Op::ArrayGet {
                ty: array,
                array: Box::new(Op::ArrayNewDefault {
                    ty: array,
                    len: Box::new(Op::I32Const(2)),
                }),
                index: Box::new(Op::I32Const(2)),
            }],
        );
        module.export_func(index, "f");
        let err = call(&module, "f", &[]).unwrap_err();
        assert!(matches!(err, EvalError::OutOfBounds { index: 2, len: 2 }));
    }

    #[test]
    fn casts_check_the_declared_subtype_chain() {
        let mut module = ModuleBuilder::new();
        let base = module.add_struct(StructDef {
            name: "Base".into(),
            fields: Vec::new(),
            supertype: None,
        });
        let left = module.add_struct(StructDef {
            name: "Left".into(),
            fields: vec![FieldDef {
                name: "x".into(),
                ty: ValueType::I32,
                mutable: false,
            }],
            supertype: Some(base),
        });
        let right = module.add_struct(StructDef {
            name: "Right".into(),
            fields: Vec::new(),
            supertype: Some(base),
        });
        let cast = |target| Op::RefCast {
            ty: target,
            value: Box::new(Op::StructNew {
                ty: left,
                fields: vec![Op::I32Const(3)],
            }),
        };
        let ok = module.declare_func("ok", Vec::new(), Some(ValueType::Ref(base)));
        module.define_func(ok, Vec::new(), vec![cast(base)]);
        module.export_func(ok, "ok");
        let bad = module.declare_func("bad", Vec::new(), Some(ValueType::Ref(right)));
        module.define_func(bad, Vec::new(), vec![cast(right)]);
        module.export_func(bad, "bad");

        assert!(call(&module, "ok", &[]).expect("cast").is_some());
        let err = call(&module, "bad", &[]).unwrap_err();
        assert!(matches!(err, EvalError::CastFailure(ty) if ty == right));
    }

    #[test]
    fn unbounded_recursion_exhausts_the_call_stack() {
        let mut module = ModuleBuilder::new();
        let index = module.declare_func("f", Vec::new(), Some(ValueType::I32));
        module.define_func(
            index,
            Vec::new(),
            vec![Op::Call {
                func: index,
                args: Vec::new(),
            }],
        );
        module.export_func(index, "f");
        let err = Evaluator::new(&module)
            .expect("evaluator")
            .with_max_depth(16)
            .call_export("f", &[])
            .unwrap_err();
        assert!(matches!(err, EvalError::CallStackExhausted));
    }

    #[test]
    fn unknown_exports_are_reported() {
        let module = single(Op::I32Const(1), Some(ValueType::I32));
        let err = call(&module, "main", &[]).unwrap_err();
        assert!(matches!(err, EvalError::UnknownExport(name) if name == "main"));
    }

    #[test]
    fn imports_call_their_host_closure() {
        let mut module = ModuleBuilder::new();
        let twice = module.import_func(
            "twice",
            FuncImport {
                module: "host".into(),
                name: "twice".into(),
            },
            vec![ValueType::I32],
            Some(ValueType::I32),
        );
        let main = module.declare_func("main", Vec::new(), Some(ValueType::I32));
        module.define_func(
            main,
            Vec::new(),
            vec![Op::Call {
                func: twice,
                args: vec![Op::I32Const(21)],
            }],
        );
        module.export_func(main, "main");

        let err = call(&module, "main", &[]).unwrap_err();
        assert!(matches!(err, EvalError::UnknownImport { ref module, .. } if module == "host"));

        let result = Evaluator::new(&module)
            .expect("evaluator")
            .with_host("host", "twice", |args| {
                let value = args.first().and_then(Value::as_i32).unwrap_or(0);
                Ok(Some(Value::I32(value * 2)))
            })
            .call_export("main", &[])
            .expect("run");
        assert_eq!(result.and_then(|value| value.as_i32()), Some(42));
    }
}
