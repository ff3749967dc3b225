use std::path::{Path, PathBuf};

use crate::builder::ModuleBuilder;
use crate::codegen_wasm::encode;
use crate::context::Context;
use crate::entity::EntityId;
use crate::error::CoreError;
use crate::eval::{EvalError, Evaluator, Value};
use crate::init::{bind_imports, declare_module, scan_module};
use crate::lower::lower_program;
use crate::parser::parse;
use crate::resolve::resolve_program;
use crate::scope::ScopeId;
use crate::span::SourceLocation;
use crate::stdlib::{StdlibFile, default_stdlib_root, load_stdlib_files};

/// Module holding every standard library file.
pub const STD_MODULE: &str = "std";
/// Module holding the compiled source file.
pub const SOURCE_MODULE: &str = "src";
/// Always exported from the source module, `pub` or not.
pub const ENTRY_POINT: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub stdlib_root: PathBuf,
    /// Name used for the source file in diagnostics.
    pub file_name: String,
}

impl CompileOptions {
    pub fn new(stdlib_root: impl Into<PathBuf>) -> Self {
        CompileOptions {
            stdlib_root: stdlib_root.into(),
            file_name: "main.vast".to_string(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions::new(default_stdlib_root())
    }
}

#[derive(Debug, Clone)]
pub struct CompilationArtifact {
    pub wasm: Vec<u8>,
    pub module: ModuleBuilder,
    pub stdlib: Vec<StdlibFile>,
    /// Exported function names, in export order.
    pub exports: Vec<String>,
    /// Whether the binary needs an engine with GC support.
    pub uses_gc: bool,
}

impl CompilationArtifact {
    pub fn to_wat(&self) -> String {
        self.module.to_wat()
    }

    /// Runs an export with the reference evaluator.
    pub fn run_export(&self, name: &str, args: &[Value]) -> Result<Option<Value>, EvalError> {
        Evaluator::new(&self.module)?.call_export(name, args)
    }
}

pub fn compile_wasm(
    source: &str,
    stdlib_root: impl AsRef<Path>,
) -> Result<CompilationArtifact, CoreError> {
    compile_with_options(source, &CompileOptions::new(stdlib_root.as_ref()))
}

/// Text rendering of the compiled module.
pub fn emit_wat(source: &str, stdlib_root: impl AsRef<Path>) -> Result<String, CoreError> {
    Ok(compile_wasm(source, stdlib_root)?.to_wat())
}

#[tracing::instrument(level = "debug", skip_all, fields(file = %options.file_name))]
pub fn compile_with_options(
    source: &str,
    options: &CompileOptions,
) -> Result<CompilationArtifact, CoreError> {
    let stdlib = load_stdlib_files(&options.stdlib_root)?;

    let mut ctx = Context::new()?;
    let root = ctx.scopes.root();
    let (_, std_scope) = declare_module(&mut ctx, root, STD_MODULE, SourceLocation::builtin())?;
    for file in &stdlib {
        let file_name = format!("{STD_MODULE}/{}", file.path.display());
        scan_module(&mut ctx, std_scope, &parse(&file_name, &file.contents)?)?;
    }
    let (_, src_scope) = declare_module(&mut ctx, root, SOURCE_MODULE, SourceLocation::builtin())?;
    scan_module(&mut ctx, src_scope, &parse(&options.file_name, source)?)?;

    bind_imports(&mut ctx)?;
    resolve_program(&mut ctx)?;

    let exports = collect_exports(&ctx, src_scope)?;
    let module = lower_program(&mut ctx, &exports)?;
    let wasm = encode(&module)?;
    let uses_gc = module.uses_gc();
    tracing::debug!(
        exports = exports.len(),
        bytes = wasm.len(),
        uses_gc,
        "compiled module"
    );
    Ok(CompilationArtifact {
        wasm,
        module,
        stdlib,
        exports: exports.into_iter().map(|(name, _)| name).collect(),
        uses_gc,
    })
}

/// `pub` non-generic functions of the source module, plus the entry
/// point. Export names must be unique, so exported overloads are
/// rejected.
fn collect_exports(ctx: &Context, scope: ScopeId) -> Result<Vec<(String, EntityId)>, CoreError> {
    let mut candidates: Vec<EntityId> = ctx.scopes.exports(scope).to_vec();
    for id in ctx.scopes.local(scope, ENTRY_POINT) {
        if !candidates.contains(id) {
            candidates.push(*id);
        }
    }

    let mut exports: Vec<(String, EntityId)> = Vec::new();
    for id in candidates {
        let entity = ctx.entities.get(id);
        let Some(def) = entity.as_fn() else {
            continue;
        };
        if def.is_generic() {
            continue;
        }
        if exports.iter().any(|(name, _)| *name == entity.name) {
            return Err(CoreError::DuplicateBinding {
                name: entity.name.clone(),
                location: entity.location.clone(),
            });
        }
        exports.push((entity.name.clone(), id));
    }
    Ok(exports)
}
