//! Binary encoding of a `ModuleBuilder` with `wasm-encoder`.
//!
//! All GC types (structs and arrays) are emitted as one recursive type
//! group so they may refer to each other freely; function types follow,
//! one per function. Imported functions are numbered before defined
//! ones, so builder function indices are remapped on the way out. Labels
//! in the op tree are turned into relative branch depths with a stack of
//! open control frames.

use std::borrow::Cow;

use wasm_encoder::{
    ArrayType, BlockType, CodeSection, CompositeInnerType, CompositeType, ConstExpr, Encode,
    EntityType, ExportKind, ExportSection, FieldType, Function, FunctionSection, GlobalSection,
    GlobalType, HeapType, ImportSection, Instruction, Module, RefType, StorageType, StructType,
    SubType, TypeSection, ValType,
};

use crate::builder::{BinKind, LabelId, ModuleBuilder, NumType, Op, TypeDef, ValueType};
use crate::error::CoreError;
use crate::span::SourceLocation;

/// Encodes `module` as a WebAssembly binary.
#[tracing::instrument(level = "debug", skip_all, fields(funcs = module.funcs.len()))]
pub fn encode(module: &ModuleBuilder) -> Result<Vec<u8>, CoreError> {
    let mut types = TypeSection::new();
    let gc_count = module.types.len() as u32;
    if gc_count > 0 {
        types.ty().rec(module.types.iter().map(sub_type));
    }
    for func in &module.funcs {
        types.ty().function(
            func.params.iter().map(|ty| val_type(*ty)),
            func.result.map(val_type),
        );
    }

    let binary_index = module.binary_func_indices();
    let mut imports = ImportSection::new();
    let mut functions = FunctionSection::new();
    for (index, func) in module.funcs.iter().enumerate() {
        let ty = gc_count + index as u32;
        match &func.import {
            Some(import) => {
                imports.import(&import.module, &import.name, EntityType::Function(ty));
            }
            None => {
                functions.function(ty);
            }
        }
    }

    let mut globals = GlobalSection::new();
    for global in &module.globals {
        let mut init = Vec::new();
        let mut encoder =
            FuncEncoder::new(&binary_index, |insn: &Instruction<'_>| insn.encode(&mut init));
        encoder.op(&global.init)?;
        globals.global(
            GlobalType {
                val_type: val_type(global.ty),
                mutable: false,
                shared: false,
            },
            &ConstExpr::raw(init),
        );
    }

    let mut exports = ExportSection::new();
    for (index, func) in module.funcs.iter().enumerate() {
        if let Some(name) = &func.export {
            exports.export(name, ExportKind::Func, binary_index[index]);
        }
    }

    let mut code = CodeSection::new();
    for func in module.funcs.iter().filter(|func| func.import.is_none()) {
        let mut function =
            Function::new_with_locals_types(func.locals.iter().map(|ty| val_type(*ty)));
        let mut encoder = FuncEncoder::new(&binary_index, |insn: &Instruction<'_>| {
            function.instruction(insn);
        });
        for op in &func.body {
            encoder.op(op)?;
        }
        function.instruction(&Instruction::End);
        code.function(&function);
    }

    let mut wasm = Module::new();
    wasm.section(&types);
    if !imports.is_empty() {
        wasm.section(&imports);
    }
    wasm.section(&functions);
    if !module.globals.is_empty() {
        wasm.section(&globals);
    }
    wasm.section(&exports);
    wasm.section(&code);
    let bytes = wasm.finish();
    tracing::debug!(bytes = bytes.len(), gc_types = gc_count, "encoded module");
    Ok(bytes)
}

fn val_type(ty: ValueType) -> ValType {
    match ty {
        ValueType::I32 => ValType::I32,
        ValueType::I64 => ValType::I64,
        ValueType::F32 => ValType::F32,
        ValueType::F64 => ValType::F64,
        ValueType::Ref(index) => ValType::Ref(RefType {
            nullable: true,
            heap_type: HeapType::Concrete(index),
        }),
    }
}

fn field_type(ty: ValueType, mutable: bool) -> FieldType {
    FieldType {
        element_type: StorageType::Val(val_type(ty)),
        mutable,
    }
}

fn sub_type(def: &TypeDef) -> SubType {
    let (inner, supertype_idx, is_final) = match def {
        TypeDef::Struct(def) => {
            let fields = def
                .fields
                .iter()
                .map(|field| field_type(field.ty, field.mutable))
                .collect();
            (CompositeInnerType::Struct(StructType { fields }), def.supertype, false)
        }
        TypeDef::Array(def) => (
            CompositeInnerType::Array(ArrayType(field_type(def.element, def.mutable))),
            None,
            true,
        ),
    };
    SubType {
        is_final,
        supertype_idx,
        composite_type: CompositeType {
            inner,
            shared: false,
        },
    }
}

fn unsupported(what: String) -> CoreError {
    CoreError::semantic(what, &SourceLocation::builtin())
}

/// Emits ops through `sink`, tracking open control frames.
struct FuncEncoder<'m, F> {
    sink: F,
    /// Binary index of each builder function.
    funcs: &'m [u32],
    /// Innermost frame last; `None` for frames that are never branch
    /// targets.
    frames: Vec<Option<LabelId>>,
}

impl<'m, F: FnMut(&Instruction<'_>)> FuncEncoder<'m, F> {
    fn new(funcs: &'m [u32], sink: F) -> Self {
        FuncEncoder {
            sink,
            funcs,
            frames: Vec::new(),
        }
    }

    fn emit(&mut self, insn: Instruction<'_>) {
        (self.sink)(&insn);
    }

    fn depth(&self, label: LabelId) -> Result<u32, CoreError> {
        self.frames
            .iter()
            .rev()
            .position(|frame| *frame == Some(label))
            .map(|depth| depth as u32)
            .ok_or_else(|| unsupported(format!("branch to unknown label {}", label.index())))
    }

    fn body(&mut self, label: Option<LabelId>, ops: &[Op]) -> Result<(), CoreError> {
        self.frames.push(label);
        for op in ops {
            self.op(op)?;
        }
        self.frames.pop();
        self.emit(Instruction::End);
        Ok(())
    }

    fn op(&mut self, op: &Op) -> Result<(), CoreError> {
        match op {
            Op::I32Const(value) => self.emit(Instruction::I32Const(*value)),
            Op::I64Const(value) => self.emit(Instruction::I64Const(*value)),
            Op::F32Const(value) => self.emit(Instruction::F32Const((*value).into())),
            Op::F64Const(value) => self.emit(Instruction::F64Const((*value).into())),
            Op::LocalGet(local) => self.emit(Instruction::LocalGet(*local)),
            Op::LocalSet { local, value } => {
                self.op(value)?;
                self.emit(Instruction::LocalSet(*local));
            }
            Op::GlobalGet(global) => self.emit(Instruction::GlobalGet(*global)),
            Op::Binary {
                op,
                ty,
                left,
                right,
            } => {
                self.op(left)?;
                self.op(right)?;
                let insn = binary_instruction(*op, *ty).ok_or_else(|| {
                    unsupported(format!("`{}` is not defined for {ty:?}", op.name()))
                })?;
                self.emit(insn);
            }
            Op::Eqz { ty, value } => {
                self.op(value)?;
                match ty {
                    NumType::I32 => self.emit(Instruction::I32Eqz),
                    NumType::I64 => self.emit(Instruction::I64Eqz),
                    NumType::F32 | NumType::F64 => {
                        return Err(unsupported(format!("eqz is not defined for {ty:?}")));
                    }
                }
            }
            Op::Call { func, args } => {
                for arg in args {
                    self.op(arg)?;
                }
                let index = self
                    .funcs
                    .get(*func as usize)
                    .copied()
                    .ok_or_else(|| unsupported(format!("call to undeclared function {func}")))?;
                self.emit(Instruction::Call(index));
            }
            Op::Block {
                label,
                result,
                body,
            } => {
                self.emit(Instruction::Block(block_type(*result)));
                self.body(Some(*label), body)?;
            }
            Op::Loop { label, body } => {
                self.emit(Instruction::Loop(BlockType::Empty));
                self.body(Some(*label), body)?;
            }
            Op::If {
                result,
                cond,
                then_body,
                else_body,
            } => {
                self.op(cond)?;
                self.emit(Instruction::If(block_type(*result)));
                self.frames.push(None);
                for op in then_body {
                    self.op(op)?;
                }
                if !else_body.is_empty() {
                    self.emit(Instruction::Else);
                    for op in else_body {
                        self.op(op)?;
                    }
                }
                self.frames.pop();
                self.emit(Instruction::End);
            }
            Op::Br { label, value } => {
                if let Some(value) = value {
                    self.op(value)?;
                }
                let depth = self.depth(*label)?;
                self.emit(Instruction::Br(depth));
            }
            Op::BrIf { label, cond } => {
                self.op(cond)?;
                let depth = self.depth(*label)?;
                self.emit(Instruction::BrIf(depth));
            }
            Op::Switch {
                targets,
                default,
                index,
            } => {
                self.op(index)?;
                let depths = targets
                    .iter()
                    .map(|label| self.depth(*label))
                    .collect::<Result<Vec<_>, _>>()?;
                let default = self.depth(*default)?;
                self.emit(Instruction::BrTable(Cow::Owned(depths), default));
            }
            Op::Return(value) => {
                if let Some(value) = value {
                    self.op(value)?;
                }
                self.emit(Instruction::Return);
            }
            Op::Drop(value) => {
                self.op(value)?;
                self.emit(Instruction::Drop);
            }
            Op::Seq(ops) => {
                for op in ops {
                    self.op(op)?;
                }
            }
            Op::Unreachable => self.emit(Instruction::Unreachable),
            Op::StructNew { ty, fields } => {
                for field in fields {
                    self.op(field)?;
                }
                self.emit(Instruction::StructNew(*ty));
            }
            Op::StructGet { ty, field, object } => {
                self.op(object)?;
                self.emit(Instruction::StructGet {
                    struct_type_index: *ty,
                    field_index: *field,
                });
            }
            Op::RefCast { ty, value } => {
                self.op(value)?;
                self.emit(Instruction::RefCastNullable(HeapType::Concrete(*ty)));
            }
            Op::ArrayNewFixed { ty, values } => {
                for value in values {
                    self.op(value)?;
                }
                self.emit(Instruction::ArrayNewFixed {
                    array_type_index: *ty,
                    array_size: values.len() as u32,
                });
            }
            Op::ArrayNewDefault { ty, len } => {
                self.op(len)?;
                self.emit(Instruction::ArrayNewDefault(*ty));
            }
            Op::ArrayGet { ty, array, index } => {
                self.op(array)?;
                self.op(index)?;
                self.emit(Instruction::ArrayGet(*ty));
            }
            Op::ArraySet {
                ty,
                array,
                index,
                value,
            } => {
                self.op(array)?;
                self.op(index)?;
                self.op(value)?;
                self.emit(Instruction::ArraySet(*ty));
            }
            Op::ArrayLen(array) => {
                self.op(array)?;
                self.emit(Instruction::ArrayLen);
            }
        }
        Ok(())
    }
}

fn block_type(result: Option<ValueType>) -> BlockType {
    match result {
        Some(ty) => BlockType::Result(val_type(ty)),
        None => BlockType::Empty,
    }
}

fn binary_instruction(op: BinKind, ty: NumType) -> Option<Instruction<'static>> {
    use Instruction as I;
    Some(match (ty, op) {
        (NumType::I32, BinKind::Add) => I::I32Add,
        (NumType::I32, BinKind::Sub) => I::I32Sub,
        (NumType::I32, BinKind::Mul) => I::I32Mul,
        (NumType::I32, BinKind::Div) => I::I32DivS,
        (NumType::I32, BinKind::Rem) => I::I32RemS,
        (NumType::I32, BinKind::Eq) => I::I32Eq,
        (NumType::I32, BinKind::Ne) => I::I32Ne,
        (NumType::I32, BinKind::Lt) => I::I32LtS,
        (NumType::I32, BinKind::Gt) => I::I32GtS,
        (NumType::I32, BinKind::Le) => I::I32LeS,
        (NumType::I32, BinKind::Ge) => I::I32GeS,
        (NumType::I32, BinKind::And) => I::I32And,
        (NumType::I32, BinKind::Or) => I::I32Or,
        (NumType::I64, BinKind::Add) => I::I64Add,
        (NumType::I64, BinKind::Sub) => I::I64Sub,
        (NumType::I64, BinKind::Mul) => I::I64Mul,
        (NumType::I64, BinKind::Div) => I::I64DivS,
        (NumType::I64, BinKind::Rem) => I::I64RemS,
        (NumType::I64, BinKind::Eq) => I::I64Eq,
        (NumType::I64, BinKind::Ne) => I::I64Ne,
        (NumType::I64, BinKind::Lt) => I::I64LtS,
        (NumType::I64, BinKind::Gt) => I::I64GtS,
        (NumType::I64, BinKind::Le) => I::I64LeS,
        (NumType::I64, BinKind::Ge) => I::I64GeS,
        (NumType::F32, BinKind::Add) => I::F32Add,
        (NumType::F32, BinKind::Sub) => I::F32Sub,
        (NumType::F32, BinKind::Mul) => I::F32Mul,
        (NumType::F32, BinKind::Div) => I::F32Div,
        (NumType::F32, BinKind::Eq) => I::F32Eq,
        (NumType::F32, BinKind::Ne) => I::F32Ne,
        (NumType::F32, BinKind::Lt) => I::F32Lt,
        (NumType::F32, BinKind::Gt) => I::F32Gt,
        (NumType::F32, BinKind::Le) => I::F32Le,
        (NumType::F32, BinKind::Ge) => I::F32Ge,
        (NumType::F64, BinKind::Add) => I::F64Add,
        (NumType::F64, BinKind::Sub) => I::F64Sub,
        (NumType::F64, BinKind::Mul) => I::F64Mul,
        (NumType::F64, BinKind::Div) => I::F64Div,
        (NumType::F64, BinKind::Eq) => I::F64Eq,
        (NumType::F64, BinKind::Ne) => I::F64Ne,
        (NumType::F64, BinKind::Lt) => I::F64Lt,
        (NumType::F64, BinKind::Gt) => I::F64Gt,
        (NumType::F64, BinKind::Le) => I::F64Le,
        (NumType::F64, BinKind::Ge) => I::F64Ge,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FieldDef, FuncImport, StructDef};
    use wasmparser::{Validator, WasmFeatures};

    fn validate(bytes: &[u8]) {
        Validator::new_with_features(WasmFeatures::all())
            .validate_all(bytes)
            .expect("valid module");
    }

    fn countdown() -> ModuleBuilder {
        // Sums n + (n - 1) + ... + 1 with a loop.
        let mut module = ModuleBuilder::new();
        let index = module.declare_func("sum", vec![ValueType::I32], Some(ValueType::I32));
        let (exit, top) = (module.fresh_label(), module.fresh_label());
        let n = || Box::new(Op::LocalGet(0));
        let body = vec![
            Op::Block {
                label: exit,
                result: None,
                body: vec![Op::Loop {
                    label: top,
                    body: vec![
                        Op::BrIf {
                            label: exit,
                            cond: Box::new(Op::Eqz {
                                ty: NumType::I32,
                                value: n(),
                            }),
                        },
                        Op::LocalSet {
                            local: 1,
                            value: Box::new(Op::Binary {
                                op: BinKind::Add,
                                ty: NumType::I32,
                                left: Box::new(Op::LocalGet(1)),
                                right: n(),
                            }),
                        },
                        Op::LocalSet {
                            local: 0,
                            value: Box::new(Op::Binary {
                                op: BinKind::Sub,
                                ty: NumType::I32,
                                left: n(),
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
            Op::LocalGet(1),
        ];
        module.define_func(index, vec![ValueType::I32], body);
        module.export_func(index, "sum");
        module
    }

    #[test]
    fn encodes_loops_with_relative_branch_depths() {
        let bytes = encode(&countdown()).expect("encode");
        validate(&bytes);

        let engine = wasmi::Engine::default();
        let module = wasmi::Module::new(&engine, &bytes).expect("module");
        let mut store = wasmi::Store::new(&engine, ());
        let instance = wasmi::Linker::new(&engine)
            .instantiate_and_start(&mut store, &module)
            .expect("instantiate");
        let sum = instance
            .get_typed_func::<i32, i32>(&store, "sum")
            .expect("typed func");
        assert_eq!(sum.call(&mut store, 10).expect("call"), 55);
    }

    #[test]
    fn struct_subtypes_and_constant_globals_validate() {
        let mut module = ModuleBuilder::new();
        let ids = module.array_type(ValueType::I32, false);
        let base = module.add_struct(StructDef {
            name: "Base".into(),
            fields: vec![FieldDef {
                name: "__ancestors".into(),
                ty: ValueType::Ref(ids),
                mutable: false,
            }],
            supertype: None,
        });
        let mut child_fields = module.struct_def(base).expect("base").fields.clone();
        child_fields.push(FieldDef {
            name: "x".into(),
            ty: ValueType::F64,
            mutable: false,
        });
        let child = module.add_struct(StructDef {
            name: "Child".into(),
            fields: child_fields,
            supertype: Some(base),
        });
        let chain = module.add_global(
            "chain",
            ValueType::Ref(ids),
            Op::ArrayNewFixed {
                ty: ids,
                values: vec![Op::I32Const(2), Op::I32Const(1)],
            },
        );
        let make = module.declare_func("make", Vec::new(), Some(ValueType::Ref(base)));
        module.define_func(
            make,
            Vec::new(),
            vec![Op::StructNew {
                ty: child,
                fields: vec![Op::GlobalGet(chain), Op::F64Const(1.5)],
            }],
        );
        let x = module.declare_func("x", Vec::new(), Some(ValueType::F64));
        module.define_func(
            x,
            Vec::new(),
            vec![Op::StructGet {
                ty: child,
                field: 1,
                object: Box::new(Op::RefCast {
                    ty: child,
                    value: Box::new(Op::Call {
                        func: make,
                        args: Vec::new(),
                    }),
                }),
            }],
        );
        module.export_func(x, "x");
        validate(&encode(&module).expect("encode"));
    }

    #[test]
    fn float_remainder_is_rejected() {
        let mut module = ModuleBuilder::new();
        let index = module.declare_func("rem", Vec::new(), Some(ValueType::F64));
        module.define_func(
            index,
            Vec::new(),
            vec![Op::Binary {
                op: BinKind::Rem,
                ty: NumType::F64,
                left: Box::new(Op::F64Const(1.0)),
                right: Box::new(Op::F64Const(2.0)),
            }],
        );
        let err = encode(&module).unwrap_err();
        assert!(matches!(err, CoreError::SemanticError { .. }));
    }

    #[test]
    fn imports_precede_defined_functions_in_the_binary() {
        let mut module = ModuleBuilder::new();
        let main = module.declare_func("main", Vec::new(), Some(ValueType::I32));
        let double = module.import_func(
            "double",
            FuncImport {
                module: "host".into(),
                name: "double".into(),
            },
            vec![ValueType::I32],
            Some(ValueType::I32),
        );
        module.define_func(
            main,
            Vec::new(),
            vec![Op::Call {
                func: double,
                args: vec![Op::I32Const(21)],
            }],
        );
        module.export_func(main, "main");
        let wasm = encode(&module).expect("encode");
        validate(&wasm);

        let engine = wasmi::Engine::default();
        let compiled = wasmi::Module::new(&engine, &wasm).expect("module");
        let mut linker = wasmi::Linker::<()>::new(&engine);
        linker
            .func_wrap("host", "double", |value: i32| value * 2)
            .expect("link host function");
        let mut store = wasmi::Store::new(&engine, ());
        let instance = linker
            .instantiate_and_start(&mut store, &compiled)
            .expect("instantiate");
        let main = instance
            .get_typed_func::<(), i32>(&store, "main")
            .expect("main");
        assert_eq!(main.call(&mut store, ()).expect("run"), 42);
    }
}
