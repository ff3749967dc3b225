use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use voyd_core::builder::ValueType;
use voyd_core::stdlib::default_stdlib_root;
use voyd_core::{CompilationArtifact, CompileOptions, Evaluator, compile_with_options};
use wasmi::{Engine, Linker, Module, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    Wasm,
    Wat,
}

/// Compile a voyd source file to WebAssembly.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Source file; read from stdin when omitted.
    #[arg(short, long)]
    input: Option<String>,

    /// Output file. `--emit wat` prints to stdout when omitted.
    #[arg(short, long)]
    output: Option<String>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Path to the standard library root (defaults to bundled stdlib)"
    )]
    stdlib: Option<String>,

    #[arg(long, value_enum, default_value = "wasm", help = "Output format")]
    emit: Emit,

    #[arg(long, help = "Run the entry function after compiling")]
    run: bool,

    #[arg(long, default_value = "main", help = "Exported function started by --run")]
    entry: String,

    #[arg(short, long, help = "Log compiler phases at debug level")]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    execute(cli)
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    // A subscriber may already be installed when embedded; keep it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn execute(cli: Cli) -> Result<()> {
    let stdlib_root = cli
        .stdlib
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(default_stdlib_root);

    let (source, file_name) = match &cli.input {
        Some(path) => (
            fs::read_to_string(path).with_context(|| format!("failed to read input file {path}"))?,
            path.clone(),
        ),
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            (buffer, "<stdin>".to_string())
        }
    };

    let options = CompileOptions::new(stdlib_root).with_file_name(file_name.as_str());
    let artifact = compile_with_options(&source, &options)
        .with_context(|| format!("failed to compile {file_name}"))?;
    tracing::debug!(exports = ?artifact.exports, uses_gc = artifact.uses_gc, "compiled");

    match (cli.emit, &cli.output) {
        (Emit::Wasm, Some(path)) => write_output(path, &artifact.wasm)?,
        (Emit::Wasm, None) if !cli.run => bail!("--output is required for --emit wasm"),
        (Emit::Wasm, None) => {}
        (Emit::Wat, Some(path)) => write_output(path, artifact.to_wat().as_bytes())?,
        (Emit::Wat, None) => print!("{}", artifact.to_wat()),
    }

    if cli.run {
        match run(&artifact, &cli.entry)? {
            Some(result) => println!("Program exited with {result}"),
            None => println!("Program exited"),
        }
    }
    Ok(())
}

fn write_output(path: &str, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = PathBuf::from(path).parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {parent:?}"))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write output file {path}"))?;
    Ok(())
}

/// Host namespace of the functions a program can `declare`.
const HOST_MODULE: &str = "imports";

/// Runs `entry`, on `wasmi` when the module is MVP-only and on the
/// reference evaluator otherwise. Both provide `imports.print(i32)`.
fn run(artifact: &CompilationArtifact, entry: &str) -> Result<Option<String>> {
    let (_, func) = artifact
        .module
        .exported_func(entry)
        .with_context(|| format!("no exported function named `{entry}`"))?;
    if !func.params.is_empty() {
        bail!("`{entry}` takes parameters and cannot be run directly");
    }
    if artifact.uses_gc {
        tracing::debug!(entry, "running on the reference evaluator");
        let mut evaluator = Evaluator::new(&artifact.module)
            .context("failed to load module")?
            .with_host(HOST_MODULE, "print", |args| {
                if let [value] = args {
                    println!("{value}");
                }
                Ok(None)
            });
        let result = evaluator
            .call_export(entry, &[])
            .with_context(|| format!("failed to execute {entry}"))?;
        return Ok(result.map(|value| value.to_string()));
    }
    run_wasm(artifact, entry, func.result)
}

fn run_wasm(
    artifact: &CompilationArtifact,
    entry: &str,
    result: Option<ValueType>,
) -> Result<Option<String>> {
    let engine = Engine::default();
    let module = Module::new(&engine, &artifact.wasm).context("failed to compile wasm artifact")?;
    let mut linker = Linker::new(&engine);
    linker
        .func_wrap(HOST_MODULE, "print", |value: i32| println!("{value}"))
        .context("failed to define host functions")?;
    let mut store = Store::new(&engine, ());
    let instance = linker
        .instantiate_and_start(&mut store, &module)
        .context("failed to instantiate module")?;

    macro_rules! call {
        ($ty:ty) => {{
            let func = instance
                .get_typed_func::<(), $ty>(&store, entry)
                .with_context(|| format!("exported {entry} function missing or has wrong type"))?;
            func.call(&mut store, ())
                .with_context(|| format!("failed to execute {entry}"))?
        }};
    }
    Ok(match result {
        Some(ValueType::I32) => Some(call!(i32).to_string()),
        Some(ValueType::I64) => Some(call!(i64).to_string()),
        Some(ValueType::F32) => Some(call!(f32).to_string()),
        Some(ValueType::F64) => Some(call!(f64).to_string()),
        Some(ValueType::Ref(_)) => bail!("`{entry}` returns a reference"),
        None => {
            call!(());
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_cmd::Command;
    use predicates::prelude::*;
    use tempfile::tempdir;

    const FIB: &str = "
        (use (:: std all))
        (fn fib (parameters (: n i32)) (return_type i32)
          (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2)))))
        (pub (fn main (parameters) (fib 10)))
    ";

    const SHAPES: &str = "
        (obj Vec (: x i32) (: y i32))
        (obj Point (extends Vec) (: x i32) (: y i32) (: z i32))
        (fn member (parameters (: v Vec))
          (match v (=> Point (z v)) (else (y v))))
        (fn main (parameters)
          (member (Point (object (: x 1) (: y 2) (: z 13)))))
        (pub (fn half (parameters) 2.5))
    ";

    #[test]
    fn compiles_and_runs_wasm() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("input.vast");
        fs::write(&input_path, FIB).expect("write input");
        let output_path = dir.path().join("out.wasm");

        Command::cargo_bin("voyd")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--run")
            .assert()
            .success()
            .stdout(predicate::str::contains("Program exited with 55"));

        assert!(output_path.exists(), "wasm output was not created");
    }

    #[test]
    fn runs_gc_modules_on_the_evaluator() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("shapes.vast");
        fs::write(&input_path, SHAPES).expect("write input");

        Command::cargo_bin("voyd")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--run")
            .assert()
            .success()
            .stdout(predicate::str::contains("Program exited with 13"));

        Command::cargo_bin("voyd")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--run")
            .arg("--entry")
            .arg("half")
            .assert()
            .success()
            .stdout(predicate::str::contains("Program exited with 2.5"));
    }

    #[test]
    fn declared_functions_call_the_host() {
        let source = "
            (declare \"imports\" (pub (fn print (parameters (: v i32)))))
            (fn main (parameters) (return_type i32)
              (print 41)
              (+ 41 1))
        ";
        Command::cargo_bin("voyd")
            .expect("binary exists")
            .arg("--run")
            .write_stdin(source)
            .assert()
            .success()
            .stdout(predicate::str::contains("41\nProgram exited with 42"));
    }

    #[test]
    fn emits_wat() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("shapes.vast");
        fs::write(&input_path, SHAPES).expect("write input");
        let output_path = dir.path().join("out.wat");

        Command::cargo_bin("voyd")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--emit")
            .arg("wat")
            .assert()
            .success();

        let wat = fs::read_to_string(&output_path).expect("read wat");
        assert!(wat.starts_with("(module"));
        assert!(wat.contains("$Point"));
    }

    #[test]
    fn reads_source_from_stdin() {
        Command::cargo_bin("voyd")
            .expect("binary exists")
            .arg("--emit")
            .arg("wat")
            .write_stdin("(fn main (parameters) (return_type i32) 7)")
            .assert()
            .success()
            .stdout(predicate::str::contains("(export \"main\""));
    }

    #[test]
    fn supports_custom_stdlib_root() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("input.vast");
        fs::write(
            &input_path,
            "(use (:: std all)) (fn main (parameters) (return_type i32) (seven))",
        )
        .expect("write input");
        let output_path = dir.path().join("out.wasm");

        let stdlib_root = dir.path().join("stdlib");
        fs::create_dir_all(&stdlib_root).expect("create stdlib root");
        fs::write(
            stdlib_root.join("seven.vast"),
            "(pub (fn seven (parameters) (return_type i32) 7))",
        )
        .expect("write stdlib file");

        Command::cargo_bin("voyd")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--stdlib")
            .arg(&stdlib_root)
            .arg("--run")
            .assert()
            .success()
            .stdout(predicate::str::contains("Program exited with 7"));

        assert!(output_path.exists(), "wasm output was not created");
    }

    #[test]
    fn reports_missing_stdlib_root() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("input.vast");
        fs::write(&input_path, FIB).expect("write input");
        let output_path = dir.path().join("out.wasm");

        Command::cargo_bin("voyd")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--stdlib")
            .arg(dir.path().join("missing"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("standard library directory was not found"));
    }

    #[test]
    fn reports_resolution_errors_with_locations() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("input.vast");
        fs::write(&input_path, "(fn main (parameters) (return_type i32)\n  (missing 1))")
            .expect("write input");

        Command::cargo_bin("voyd")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--emit")
            .arg("wat")
            .assert()
            .failure()
            .stderr(predicate::str::contains("unresolved identifier `missing`"))
            .stderr(predicate::str::contains("input.vast:2:"));
    }
}
