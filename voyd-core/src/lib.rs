//! Core compiler for the voyd language.
//!
//! The pipeline is roughly:
//!
//!   source .vast
//!     -> lexer / parser   (normalized s-expression tree)
//!     -> init             (entities, scopes, HIR, imports)
//!     -> resolve          (types, overloads, generic instances)
//!     -> lower            (module builder: GC structs, functions, matches)
//!     -> codegen_wasm     (wasm-encoder)
//!
//! All state of one compile lives in a `Context`; there is no global
//! state. Higher-level tools (the CLI, tests) should depend on this crate
//! rather than reimplementing the pipeline.

// ---------------------------------------------------------------------
// Error handling and source locations
// ---------------------------------------------------------------------

pub mod error;
pub mod span;

// ---------------------------------------------------------------------
// Front-end: reading the normalized tree
// ---------------------------------------------------------------------

pub mod ast;
pub mod lexer;
pub mod parser;

// ---------------------------------------------------------------------
// Semantic layers: entities, scopes, HIR, type resolution
// ---------------------------------------------------------------------

pub mod context;
pub mod entity;
pub mod generics;
pub mod hir;
pub mod inheritance;
pub mod init;
pub mod resolve;
pub mod scope;
pub mod types;

// ---------------------------------------------------------------------
// Builtins and stdlib integration
// ---------------------------------------------------------------------

pub mod builtins;
pub mod stdlib;

// ---------------------------------------------------------------------
// Back-end: lowering, code generation, execution and orchestration
// ---------------------------------------------------------------------

pub mod builder;
pub mod codegen_wasm;
pub mod compiler;
pub mod eval;
pub mod lower;
mod match_compiler;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use compiler::{
    CompilationArtifact, CompileOptions, compile_wasm, compile_with_options, emit_wat,
};
pub use error::CoreError;
pub use eval::{EvalError, Evaluator, Value};
pub use stdlib::default_stdlib_root;
