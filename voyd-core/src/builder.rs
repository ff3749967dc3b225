//! In-memory WebAssembly module under construction.
//!
//! Lowering talks to this builder instead of emitting bytes directly: it
//! declares GC struct/array types, globals and functions whose bodies are
//! folded `Op` trees with typed labels. `codegen_wasm` serializes the
//! result, `eval` executes it, and `to_wat` renders it for humans.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::entity::define_id;

define_id! {
    /// Branch target. Resolved to a relative depth only at encoding time.
    pub struct LabelId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumType {
    I32,
    I64,
    F32,
    F64,
}

impl NumType {
    pub fn is_float(self) -> bool {
        matches!(self, NumType::F32 | NumType::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            NumType::I32 => "i32",
            NumType::I64 => "i64",
            NumType::F32 => "f32",
            NumType::F64 => "f64",
        }
    }
}

/// Value types. References are always nullable and concrete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    Ref(u32),
}

impl From<NumType> for ValueType {
    fn from(ty: NumType) -> Self {
        match ty {
            NumType::I32 => ValueType::I32,
            NumType::I64 => ValueType::I64,
            NumType::F32 => ValueType::F32,
            NumType::F64 => ValueType::F64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinKind {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

impl BinKind {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinKind::Eq | BinKind::Ne | BinKind::Lt | BinKind::Gt | BinKind::Le | BinKind::Ge
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BinKind::Add => "add",
            BinKind::Sub => "sub",
            BinKind::Mul => "mul",
            BinKind::Div => "div",
            BinKind::Rem => "rem",
            BinKind::Eq => "eq",
            BinKind::Ne => "ne",
            BinKind::Lt => "lt",
            BinKind::Gt => "gt",
            BinKind::Le => "le",
            BinKind::Ge => "ge",
            BinKind::And => "and",
            BinKind::Or => "or",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: ValueType,
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub supertype: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDef {
    pub name: String,
    pub element: ValueType,
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDef {
    Struct(StructDef),
    Array(ArrayDef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<ValueType>,
    pub result: Option<ValueType>,
    pub locals: Vec<ValueType>,
    pub body: Vec<Op>,
    pub export: Option<String>,
    /// Host function the body is supplied by; imported functions have no
    /// locals or body.
    pub import: Option<FuncImport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncImport {
    pub module: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDef {
    pub name: String,
    pub ty: ValueType,
    /// Constant initializer.
    pub init: Op,
}

/// Folded instruction tree. Operands are evaluated left to right before
/// the operation itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    LocalGet(u32),
    LocalSet {
        local: u32,
        value: Box<Op>,
    },
    GlobalGet(u32),
    Binary {
        op: BinKind,
        ty: NumType,
        left: Box<Op>,
        right: Box<Op>,
    },
    Eqz {
        ty: NumType,
        value: Box<Op>,
    },
    Call {
        func: u32,
        args: Vec<Op>,
    },
    Block {
        label: LabelId,
        result: Option<ValueType>,
        body: Vec<Op>,
    },
    Loop {
        label: LabelId,
        body: Vec<Op>,
    },
    If {
        result: Option<ValueType>,
        cond: Box<Op>,
        then_body: Vec<Op>,
        else_body: Vec<Op>,
    },
    Br {
        label: LabelId,
        value: Option<Box<Op>>,
    },
    BrIf {
        label: LabelId,
        cond: Box<Op>,
    },
    /// `br_table`: `targets[index]`, or `default` when out of range.
    Switch {
        targets: Vec<LabelId>,
        default: LabelId,
        index: Box<Op>,
    },
    Return(Option<Box<Op>>),
    Drop(Box<Op>),
    /// Plain sequence; not a control frame.
    Seq(Vec<Op>),
    Unreachable,
    StructNew {
        ty: u32,
        fields: Vec<Op>,
    },
    StructGet {
        ty: u32,
        field: u32,
        object: Box<Op>,
    },
    RefCast {
        ty: u32,
        value: Box<Op>,
    },
    ArrayNewFixed {
        ty: u32,
        values: Vec<Op>,
    },
    ArrayNewDefault {
        ty: u32,
        len: Box<Op>,
    },
    ArrayGet {
        ty: u32,
        array: Box<Op>,
        index: Box<Op>,
    },
    ArraySet {
        ty: u32,
        array: Box<Op>,
        index: Box<Op>,
        value: Box<Op>,
    },
    ArrayLen(Box<Op>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleBuilder {
    pub types: Vec<TypeDef>,
    pub funcs: Vec<FuncDef>,
    pub globals: Vec<GlobalDef>,
    array_types: HashMap<(ValueType, bool), u32>,
    next_label: u32,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder::default()
    }

    pub fn add_struct(&mut self, def: StructDef) -> u32 {
        self.types.push(TypeDef::Struct(def));
        (self.types.len() - 1) as u32
    }

    /// Fills in the fields of a struct reserved with `add_struct`.
    pub fn set_struct_fields(&mut self, index: u32, fields: Vec<FieldDef>) {
        if let Some(TypeDef::Struct(def)) = self.types.get_mut(index as usize) {
            def.fields = fields;
        }
    }

    /// Index of the array type with the given element, declaring it once.
    pub fn array_type(&mut self, element: ValueType, mutable: bool) -> u32 {
        if let Some(index) = self.array_types.get(&(element, mutable)) {
            return *index;
        }
        let index = self.types.len() as u32;
        self.types.push(TypeDef::Array(ArrayDef {
            name: format!("array_{index}"),
            element,
            mutable,
        }));
        self.array_types.insert((element, mutable), index);
        index
    }

    pub fn struct_def(&self, index: u32) -> Option<&StructDef> {
        match self.types.get(index as usize) {
            Some(TypeDef::Struct(def)) => Some(def),
            _ => None,
        }
    }

    pub fn array_def(&self, index: u32) -> Option<&ArrayDef> {
        match self.types.get(index as usize) {
            Some(TypeDef::Array(def)) => Some(def),
            _ => None,
        }
    }

    /// True when `sub` is `sup` or declares it as a (transitive) supertype.
    pub fn is_subtype(&self, sub: u32, sup: u32) -> bool {
        let mut current = Some(sub);
        while let Some(index) = current {
            if index == sup {
                return true;
            }
            current = self.struct_def(index).and_then(|def| def.supertype);
        }
        false
    }

    pub fn declare_func(
        &mut self,
        name: impl Into<String>,
        params: Vec<ValueType>,
        result: Option<ValueType>,
    ) -> u32 {
        self.funcs.push(FuncDef {
            name: name.into(),
            params,
            result,
            locals: Vec::new(),
            body: Vec::new(),
            export: None,
            import: None,
        });
        (self.funcs.len() - 1) as u32
    }

    /// Declares a function provided by the host as `module.name`.
    pub fn import_func(
        &mut self,
        name: impl Into<String>,
        import: FuncImport,
        params: Vec<ValueType>,
        result: Option<ValueType>,
    ) -> u32 {
        let index = self.declare_func(name, params, result);
        self.funcs[index as usize].import = Some(import);
        index
    }

    /// Binary function index of every function, by builder index. The
    /// binary numbers imports before defined functions.
    pub fn binary_func_indices(&self) -> Vec<u32> {
        let imported = self.funcs.iter().filter(|func| func.import.is_some()).count() as u32;
        let (mut next_import, mut next_defined) = (0, imported);
        self.funcs
            .iter()
            .map(|func| {
                let slot = if func.import.is_some() {
                    &mut next_import
                } else {
                    &mut next_defined
                };
                *slot += 1;
                *slot - 1
            })
            .collect()
    }

    pub fn define_func(&mut self, index: u32, locals: Vec<ValueType>, body: Vec<Op>) {
        if let Some(func) = self.funcs.get_mut(index as usize) {
            func.locals = locals;
            func.body = body;
        }
    }

    pub fn export_func(&mut self, index: u32, name: impl Into<String>) {
        if let Some(func) = self.funcs.get_mut(index as usize) {
            func.export = Some(name.into());
        }
    }

    pub fn exported_func(&self, name: &str) -> Option<(u32, &FuncDef)> {
        self.funcs
            .iter()
            .enumerate()
            .find(|(_, func)| func.export.as_deref() == Some(name))
            .map(|(index, func)| (index as u32, func))
    }

    pub fn add_global(&mut self, name: impl Into<String>, ty: ValueType, init: Op) -> u32 {
        self.globals.push(GlobalDef {
            name: name.into(),
            ty,
            init,
        });
        (self.globals.len() - 1) as u32
    }

    pub fn fresh_label(&mut self) -> LabelId {
        self.next_label += 1;
        LabelId::new(self.next_label)
    }

    /// Whether the module needs the GC proposal.
    pub fn uses_gc(&self) -> bool {
        !self.types.is_empty()
    }

    /// Folded text rendering, for `--emit wat` and debugging.
    pub fn to_wat(&self) -> String {
        let mut printer = WatPrinter {
            module: self,
            out: String::new(),
            indent: 1,
        };
        printer.module();
        printer.out
    }
}

struct WatPrinter<'m> {
    module: &'m ModuleBuilder,
    out: String,
    indent: usize,
}

impl WatPrinter<'_> {
    fn module(&mut self) {
        let module = self.module;
        self.out.push_str("(module\n");
        if !module.types.is_empty() {
            self.line("(rec");
            self.indent += 1;
            for def in &module.types {
                let text = match def {
                    TypeDef::Struct(def) => {
                        let fields: Vec<String> = def
                            .fields
                            .iter()
                            .map(|field| {
                                format!(
                                    " (field ${} {})",
                                    sanitize(&field.name),
                                    self.storage(field.ty, field.mutable)
                                )
                            })
                            .collect();
                        let supertype = def
                            .supertype
                            .map(|index| format!(" {}", self.type_name(index)))
                            .unwrap_or_default();
                        format!(
                            "(type ${} (sub{} (struct{})))",
                            sanitize(&def.name),
                            supertype,
                            fields.concat()
                        )
                    }
                    TypeDef::Array(def) => format!(
                        "(type ${} (array {}))",
                        sanitize(&def.name),
                        self.storage(def.element, def.mutable)
                    ),
                };
                self.line(&text);
            }
            self.indent -= 1;
            self.line(")");
        }
        for global in &module.globals {
            let header = format!(
                "(global ${} {}",
                sanitize(&global.name),
                self.value_type(global.ty)
            );
            self.line(&header);
            self.indent += 1;
            self.op(&global.init);
            self.indent -= 1;
            self.line(")");
        }
        // Imports come first in the text format.
        let imports = module.funcs.iter().filter(|func| func.import.is_some());
        let defined = module.funcs.iter().filter(|func| func.import.is_none());
        for func in imports.chain(defined) {
            let mut header = format!("(func ${}", sanitize(&func.name));
            if let Some(export) = &func.export {
                let _ = write!(header, " (export \"{export}\")");
            }
            if let Some(import) = &func.import {
                let _ = write!(header, " (import \"{}\" \"{}\")", import.module, import.name);
            }
            for param in &func.params {
                let _ = write!(header, " (param {})", self.value_type(*param));
            }
            if let Some(result) = func.result {
                let _ = write!(header, " (result {})", self.value_type(result));
            }
            self.line(&header);
            self.indent += 1;
            if !func.locals.is_empty() {
                let locals: Vec<String> =
                    func.locals.iter().map(|ty| self.value_type(*ty)).collect();
                self.line(&format!("(local {})", locals.join(" ")));
            }
            for op in &func.body {
                self.op(op);
            }
            self.indent -= 1;
            self.line(")");
        }
        self.out.push_str(")\n");
    }

    fn op(&mut self, op: &Op) {
        match op {
            Op::I32Const(value) => self.line(&format!("(i32.const {value})")),
            Op::I64Const(value) => self.line(&format!("(i64.const {value})")),
            Op::F32Const(value) => self.line(&format!("(f32.const {value})")),
            Op::F64Const(value) => self.line(&format!("(f64.const {value})")),
            Op::LocalGet(index) => self.line(&format!("(local.get {index})")),
            Op::GlobalGet(index) => {
                let name = self
                    .module
                    .globals
                    .get(*index as usize)
                    .map_or_else(|| index.to_string(), |g| format!("${}", sanitize(&g.name)));
                self.line(&format!("(global.get {name})"))
            }
            Op::LocalSet { local, value } => self.nested(&format!("local.set {local}"), [&**value]),
            Op::Binary {
                op,
                ty,
                left,
                right,
            } => {
                let signed = if !ty.is_float()
                    && matches!(
                        op,
                        BinKind::Div | BinKind::Rem | BinKind::Lt | BinKind::Gt | BinKind::Le | BinKind::Ge
                    ) {
                    "_s"
                } else {
                    ""
                };
                let name = format!("{}.{}{}", ty.name(), op.name(), signed);
                self.nested(&name, [&**left, &**right]);
            }
            Op::Eqz { ty, value } => self.nested(&format!("{}.eqz", ty.name()), [&**value]),
            Op::Call { func, args } => {
                let name = self
                    .module
                    .funcs
                    .get(*func as usize)
                    .map_or_else(|| func.to_string(), |f| format!("${}", sanitize(&f.name)));
                self.nested(&format!("call {name}"), args.iter());
            }
            Op::Block {
                label,
                result,
                body,
            } => {
                let head = format!("block $l{}{}", label.index(), self.result(*result));
                self.nested(&head, body.iter());
            }
            Op::Loop { label, body } => {
                self.nested(&format!("loop $l{}", label.index()), body.iter());
            }
            Op::If {
                result,
                cond,
                then_body,
                else_body,
            } => {
                self.line(&format!("(if{}", self.result(*result)));
                self.indent += 1;
                self.op(cond);
                self.nested("then", then_body.iter());
                if !else_body.is_empty() {
                    self.nested("else", else_body.iter());
                }
                self.indent -= 1;
                self.line(")");
            }
            Op::Br { label, value } => {
                let head = format!("br $l{}", label.index());
                self.nested(&head, value.iter().map(|value| &**value));
            }
            Op::BrIf { label, cond } => {
                self.nested(&format!("br_if $l{}", label.index()), [&**cond]);
            }
            Op::Switch {
                targets,
                default,
                index,
            } => {
                let labels: Vec<String> =
                    targets.iter().map(|label| format!("$l{}", label.index())).collect();
                let head = format!("br_table {} $l{}", labels.join(" "), default.index());
                self.nested(&head, [&**index]);
            }
            Op::Return(value) => self.nested("return", value.iter().map(|value| &**value)),
            Op::Drop(value) => self.nested("drop", [&**value]),
            Op::Seq(ops) => ops.iter().for_each(|op| self.op(op)),
            Op::Unreachable => self.line("(unreachable)"),
            Op::StructNew { ty, fields } => {
                let head = format!("struct.new {}", self.type_name(*ty));
                self.nested(&head, fields.iter());
            }
            Op::StructGet { ty, field, object } => {
                let head = format!("struct.get {} {field}", self.type_name(*ty));
                self.nested(&head, [&**object]);
            }
            Op::RefCast { ty, value } => {
                let head = format!("ref.cast (ref null {})", self.type_name(*ty));
                self.nested(&head, [&**value]);
            }
            Op::ArrayNewFixed { ty, values } => {
                let head = format!("array.new_fixed {} {}", self.type_name(*ty), values.len());
                self.nested(&head, values.iter());
            }
            Op::ArrayNewDefault { ty, len } => {
                let head = format!("array.new_default {}", self.type_name(*ty));
                self.nested(&head, [&**len]);
            }
            Op::ArrayGet { ty, array, index } => {
                let head = format!("array.get {}", self.type_name(*ty));
                self.nested(&head, [&**array, &**index]);
            }
            Op::ArraySet {
                ty,
                array,
                index,
                value,
            } => {
                let head = format!("array.set {}", self.type_name(*ty));
                self.nested(&head, [&**array, &**index, &**value]);
            }
            Op::ArrayLen(array) => self.nested("array.len", [&**array]),
        }
    }

    fn nested<'a>(&mut self, head: &str, children: impl IntoIterator<Item = &'a Op>) {
        let mut children = children.into_iter().peekable();
        if children.peek().is_none() {
            self.line(&format!("({head})"));
            return;
        }
        self.line(&format!("({head}"));
        self.indent += 1;
        for child in children {
            self.op(child);
        }
        self.indent -= 1;
        self.line(")");
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn result(&self, result: Option<ValueType>) -> String {
        result
            .map(|ty| format!(" (result {})", self.value_type(ty)))
            .unwrap_or_default()
    }

    fn type_name(&self, index: u32) -> String {
        match self.module.types.get(index as usize) {
            Some(TypeDef::Struct(def)) => format!("${}", sanitize(&def.name)),
            Some(TypeDef::Array(def)) => format!("${}", sanitize(&def.name)),
            None => index.to_string(),
        }
    }

    fn value_type(&self, ty: ValueType) -> String {
        match ty {
            ValueType::I32 => "i32".into(),
            ValueType::I64 => "i64".into(),
            ValueType::F32 => "f32".into(),
            ValueType::F64 => "f64".into(),
            ValueType::Ref(index) => format!("(ref null {})", self.type_name(index)),
        }
    }

    fn storage(&self, ty: ValueType, mutable: bool) -> String {
        if mutable {
            format!("(mut {})", self.value_type(ty))
        } else {
            self.value_type(ty)
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_.#".contains(c) { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_types_are_declared_once_per_element() {
        let mut module = ModuleBuilder::new();
        let ints = module.array_type(ValueType::I32, true);
        let floats = module.array_type(ValueType::F64, true);
        assert_ne!(ints, floats);
        assert_eq!(module.array_type(ValueType::I32, true), ints);
        assert_ne!(module.array_type(ValueType::I32, false), ints);
        assert!(module.uses_gc());
    }

    #[test]
    fn subtype_walks_declared_supertypes() {
        let mut module = ModuleBuilder::new();
        let base = module.add_struct(StructDef {
            name: "Object".into(),
            fields: Vec::new(),
            supertype: None,
        });
        let mid = module.add_struct(StructDef {
            name: "Vec".into(),
            fields: Vec::new(),
            supertype: Some(base),
        });
        let leaf = module.add_struct(StructDef {
            name: "Point".into(),
            fields: Vec::new(),
            supertype: Some(mid),
        });
        assert!(module.is_subtype(leaf, base));
        assert!(module.is_subtype(leaf, leaf));
        assert!(!module.is_subtype(base, leaf));
    }

    #[test]
    fn renders_labels_by_id() {
        let mut module = ModuleBuilder::new();
        let label = module.fresh_label();
        let main = module.declare_func("main", Vec::new(), Some(ValueType::I32));
        module.define_func(
            main,
            Vec::new(),
            vec![Op::Block {
                label,
                result: Some(ValueType::I32),
                body: vec![Op::Br {
                    label,
                    value: Some(Box::new(Op::I32Const(7))),
                }],
            }],
        );
        module.export_func(main, "main");
        let text = module.to_wat();
        assert!(text.contains("(func $main (export \"main\") (result i32)"));
        assert!(text.contains(&format!("(block $l{} (result i32)", label.index())));
        assert!(text.contains(&format!("(br $l{}", label.index())));
        assert!(!module.uses_gc());
    }

    #[test]
    fn imports_are_numbered_before_defined_functions() {
        let mut module = ModuleBuilder::new();
        let main = module.declare_func("main", Vec::new(), None);
        let print = module.import_func(
            "print",
            FuncImport {
                module: "imports".into(),
                name: "print".into(),
            },
            vec![ValueType::I32],
            None,
        );
        let helper = module.declare_func("helper", Vec::new(), None);
        assert_eq!((main, print, helper), (0, 1, 2));
        assert_eq!(module.binary_func_indices(), [1, 0, 2]);

        let text = module.to_wat();
        let import_at = text.find("(import \"imports\" \"print\")").expect("import");
        assert!(import_at < text.find("(func $main").expect("main"));
    }
}
