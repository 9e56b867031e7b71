//! Command-line interface for the Velo runtime.

use clap::{Parser, Subcommand, ValueEnum};
use miette::{Diagnostic, NamedSource, SourceSpan};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use velo_vm::{Backend, Config, Thread};

/// CLI error with source context for pretty printing.
#[derive(Debug, Error, Diagnostic)]
enum CliError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("parse error: {message}")]
    #[diagnostic(code(velo::parse_error))]
    Parse {
        message: String,
        #[source_code]
        src: NamedSource<Arc<String>>,
        #[label("here")]
        span: SourceSpan,
    },

    #[error("compile error: {message}")]
    #[diagnostic(code(velo::compile_error))]
    Compile {
        message: String,
        #[source_code]
        src: NamedSource<Arc<String>>,
        #[label("here")]
        span: SourceSpan,
    },

    #[error("runtime error: {0}")]
    Runtime(#[from] velo_vm::VmError),
}

impl CliError {
    fn from_parse(e: velo_syntax::ParseError, source: Arc<String>, filename: &str) -> Self {
        let span = e.span();
        CliError::Parse {
            message: e.to_string(),
            src: NamedSource::new(filename, source),
            span: (span.start, span.len()).into(),
        }
    }

    fn from_compile(e: velo_compile::CompileError, source: Arc<String>, filename: &str) -> Self {
        let span = e.span();
        CliError::Compile {
            message: e.to_string(),
            src: NamedSource::new(filename, source),
            span: (span.start, span.len()).into(),
        }
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "velo", version)]
#[command(about = "A vector-language runtime with a tracing JIT", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    /// Tile-wise IR interpreter.
    Tile,
    /// x86-64 machine code where possible.
    Machine,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program
    Run {
        /// Input file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Disable the tracing JIT
        #[arg(long)]
        no_jit: bool,

        /// Trace executor backend
        #[arg(long, value_enum, default_value = "tile")]
        backend: BackendArg,

        /// Print compiled traces and IR dumps
        #[arg(short, long)]
        verbose: bool,
    },

    /// Parse a file and print the expression tree
    Parse {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Compile a file and print the bytecode listing
    Dis {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            no_jit,
            backend,
            verbose,
        } => run(&file, no_jit, backend, verbose)?,
        Commands::Parse { file } => parse_only(&file)?,
        Commands::Dis { file } => disassemble(&file)?,
    }
    Ok(())
}

fn read(path: &PathBuf) -> CliResult<Arc<String>> {
    fs::read_to_string(path)
        .map(Arc::new)
        .map_err(|e| CliError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

fn run(path: &PathBuf, no_jit: bool, backend: BackendArg, verbose: bool) -> CliResult<()> {
    let source = read(path)?;
    let filename = path.display().to_string();
    let exprs = velo_syntax::parse(&source)
        .map_err(|e| CliError::from_parse(e, source.clone(), &filename))?;

    let config = Config {
        jit_enabled: !no_jit,
        verbose,
        backend: match backend {
            BackendArg::Tile => Backend::Tile,
            BackendArg::Machine => Backend::Machine,
        },
        ..Config::default()
    };
    let mut thread = Thread::with_config(config);
    let proto = velo_compile::compile_program(&exprs, &mut thread.interner)
        .map_err(|e| CliError::from_compile(e, source.clone(), &filename))?;

    info!(file = %filename, jit = !no_jit, "running");
    let global = thread.global;
    let result = thread.eval(proto, global)?;
    println!("{}", result.deparse(&thread.interner));
    if verbose {
        info!(traces = thread.jit.trace_count(), "compiled traces");
    }
    Ok(())
}

fn parse_only(path: &PathBuf) -> CliResult<()> {
    let source = read(path)?;
    let filename = path.display().to_string();
    let exprs = velo_syntax::parse(&source)
        .map_err(|e| CliError::from_parse(e, source.clone(), &filename))?;
    for e in exprs {
        println!("{}", e);
    }
    Ok(())
}

fn disassemble(path: &PathBuf) -> CliResult<()> {
    let source = read(path)?;
    let filename = path.display().to_string();
    let exprs = velo_syntax::parse(&source)
        .map_err(|e| CliError::from_parse(e, source.clone(), &filename))?;
    let mut thread = Thread::new();
    let proto = velo_compile::compile_program(&exprs, &mut thread.interner)
        .map_err(|e| CliError::from_compile(e, source.clone(), &filename))?;
    print!("{}", proto);
    Ok(())
}
