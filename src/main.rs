//! Block Expression Compiler CLI
//!
//! Usage:
//!   blockexpr "x * 2 + y" --var x:f64=1,2,3 --var y:f64=0.5,0.5,0.5
//!   blockexpr -f kernel.py --var x:i64=0,1,3,5 --kernel
//!   blockexpr "x + _i0" --var x:f64=1,2 --shape 5 --chunkshape 4 --blockshape 2 --chunk 1
//!   blockexpr "sum(x)" --var x:i32=1,2,3 --json
//!   blockexpr "sqrt(x*x + y*y)" --var x:f64=3 --var y:f64=4 --ir

use clap::Parser as ClapParser;
use colored::Colorize;
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockexpr::config::{self, RuntimeConfig};
use blockexpr::{
    ChunkGeometry, Column, CompiledExpr, Compiler, Dtype, EvalStats, InProcessHost, Input, Precision,
    Value, VariableEx,
};

#[derive(ClapParser, Debug)]
#[command(name = "blockexpr")]
#[command(version = "0.1.0")]
#[command(about = "Compiles and evaluates block expressions and element kernels")]
struct Args {
    /// Expression or kernel source (e.g., "x * 2 + y")
    #[arg(value_name = "EXPR")]
    expression: Option<String>,

    /// Read the source from a file
    #[arg(short = 'f', long = "file")]
    input_file: Option<String>,

    /// Bind an input (e.g., "x:f64=1,2,3" or "s:str=ab,cd")
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<Binding>,

    /// Output dtype
    #[arg(short = 'o', long = "output", default_value = "auto", value_parser = parse_dtype)]
    output: Dtype,

    /// Element count when no inputs are bound
    #[arg(short = 'n', long = "count")]
    count: Option<usize>,

    /// ND array shape (e.g., "5" or "4,6")
    #[arg(long = "shape", value_parser = parse_dims)]
    shape: Option<Dims>,

    /// ND chunk shape
    #[arg(long = "chunkshape", value_parser = parse_dims)]
    chunkshape: Option<Dims>,

    /// ND block shape
    #[arg(long = "blockshape", value_parser = parse_dims)]
    blockshape: Option<Dims>,

    /// Linear chunk index for ND evaluation
    #[arg(long = "chunk", default_value = "0")]
    chunk: u64,

    /// Linear block index for ND evaluation
    #[arg(long = "block", default_value = "0")]
    block: u64,

    /// Evaluate with the interpreter only
    #[arg(long = "no-jit")]
    no_jit: bool,

    /// Iteration cap for while loops
    #[arg(long = "max-while")]
    max_while: Option<u64>,

    /// Transcendental precision: u10 or u35
    #[arg(long = "precision", value_parser = parse_precision)]
    precision: Option<Precision>,

    /// Print the typed IR tree
    #[arg(short = 'p', long = "ir")]
    ir: bool,

    /// Print the lowered kernel module
    #[arg(short = 'k', long = "kernel")]
    kernel: bool,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

/// An input parsed from `--var`
#[derive(Debug, Clone)]
struct Binding {
    variable: VariableEx,
    column: Column,
}

/// Comma-separated extents
#[derive(Debug, Clone)]
struct Dims(Vec<u64>);

#[derive(Serialize)]
struct Report<'a> {
    output: Dtype,
    stats: EvalStats,
    valid_items: usize,
    values: Vec<Value>,
    kernel: Option<&'a blockexpr::KernelModule>,
}

fn parse_dtype(s: &str) -> Result<Dtype, String> {
    Dtype::from_name(s).ok_or_else(|| format!("Unknown dtype: {}", s))
}

fn parse_precision(s: &str) -> Result<Precision, String> {
    match s {
        "u10" => Ok(Precision::Ulp10),
        "u35" => Ok(Precision::Ulp35),
        _ => Err(format!("Invalid precision: {} (expected u10 or u35)", s)),
    }
}

fn parse_dims(s: &str) -> Result<Dims, String> {
    s.split(',')
        .map(|d| d.trim().parse::<u64>().map_err(|_| format!("Invalid extent: {}", d)))
        .collect::<Result<Vec<_>, _>>()
        .map(Dims)
}

fn parse_scalar(s: &str) -> Result<Value, String> {
    let s = s.trim();
    match s {
        "true" | "True" => return Ok(Value::Bool(true)),
        "false" | "False" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if let Ok(v) = s.parse::<i64>() {
        return Ok(Value::Int64(v));
    }
    if let Ok(v) = s.parse::<u64>() {
        return Ok(Value::UInt64(v));
    }
    s.parse::<f64>()
        .map(Value::Float64)
        .map_err(|_| format!("Invalid value: {}", s))
}

fn parse_var(s: &str) -> Result<Binding, String> {
    let (decl, values) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid binding format: {}", s))?;
    let (name, dtype) = decl
        .split_once(':')
        .ok_or_else(|| format!("Missing dtype in binding: {}", decl))?;
    let dtype = parse_dtype(dtype)?;
    let items: Vec<&str> = if values.is_empty() { Vec::new() } else { values.split(',').collect() };

    if dtype == Dtype::String {
        let chars = items.iter().map(|i| i.chars().count()).max().unwrap_or(0).max(1);
        return Ok(Binding {
            variable: VariableEx::string(name, chars * 4),
            column: Column::from_strs(&items, chars * 4),
        });
    }

    let values = items.iter().map(|i| parse_scalar(i)).collect::<Result<Vec<_>, _>>()?;
    let column = Column::from_values(dtype, &values)
        .ok_or_else(|| format!("Dtype {} cannot be bound to an input", dtype))?;
    Ok(Binding {
        variable: VariableEx::array(name, dtype),
        column,
    })
}

fn fail(label: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", label.red(), err);
    std::process::exit(1);
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "blockexpr=warn".into()))
        .with(fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();

    // Get source from argument, file, or stdin
    let source = if let Some(expr) = args.expression.clone() {
        expr
    } else if let Some(file) = &args.input_file {
        fs::read_to_string(file).unwrap_or_else(|e| fail("Error", format!("Failed to read file '{}': {}", file, e)))
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .unwrap_or_else(|e| fail("Error", format!("Failed to read stdin: {}", e)));
        buffer
    };

    // Runtime configuration
    let mut runtime = config::snapshot().config;
    if args.no_jit {
        runtime = runtime.with_jit(false);
    }
    if let Some(limit) = args.max_while {
        runtime = runtime.with_max_while_iterations(limit);
    }
    if let Some(precision) = args.precision {
        runtime = runtime.with_precision(precision);
    }

    let geometry = match (&args.shape, &args.chunkshape, &args.blockshape) {
        (None, None, None) => None,
        (Some(Dims(shape)), chunkshape, blockshape) => {
            let chunkshape = chunkshape.as_ref().map_or_else(|| shape.clone(), |d| d.0.clone());
            let blockshape = blockshape.as_ref().map_or_else(|| chunkshape.clone(), |d| d.0.clone());
            Some(ChunkGeometry::new(shape, &chunkshape, &blockshape).unwrap_or_else(|e| fail("Geometry error", e)))
        }
        _ => fail("Geometry error", "--chunkshape and --blockshape need --shape"),
    };

    if args.verbose {
        println!("{}", "Block Expression Compiler".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: {}", "Input".green(), source.trim());
        println!("{}: {}", "Math backend".green(), runtime.math_backend().name());
        println!("{}: {}", "JIT".green(), if runtime.jit_enabled { "on" } else { "off" });
        println!();
    }

    // Compile
    let variables: Vec<VariableEx> = args.vars.iter().map(|b| b.variable.clone()).collect();
    let mut compiler = Compiler::new()
        .output(args.output)
        .jit(runtime.jit_enabled)
        .jit_host(Arc::new(InProcessHost::new()));
    if let Some(geometry) = geometry.clone() {
        compiler = compiler.geometry(geometry);
    }
    let expr = compiler
        .compile(&source, &variables)
        .unwrap_or_else(|e| fail("Compilation error", e));

    if args.ir && !args.json_output {
        print!("{}", expr.program());
        println!();
    }

    if args.kernel && !args.json_output {
        match expr.kernel_module() {
            Some(module) => print!("{}", module),
            None => println!("{}", "(no kernel: bare expressions run on the interpreter)".dimmed()),
        }
        println!();
    }

    // Evaluate
    let inputs: Vec<Input<'_>> = args.vars.iter().map(|b| b.column.as_input()).collect();
    let (stats, valid_items, values) = match &geometry {
        Some(geometry) => evaluate_nd(&expr, &inputs, geometry, args.chunk, args.block, &runtime),
        None => evaluate_flat(&expr, &inputs, args.count, &runtime),
    };

    // Output
    if args.json_output {
        let report = Report {
            output: expr.output_dtype(),
            stats,
            valid_items,
            values,
            kernel: if args.kernel { expr.kernel_module() } else { None },
        };
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => fail("Error", format!("Failed to serialize to JSON: {}", e)),
        }
    } else {
        print_results(&expr, &stats, valid_items, &values, args.verbose);
    }
}

fn evaluate_flat(
    expr: &CompiledExpr,
    inputs: &[Input<'_>],
    count: Option<usize>,
    runtime: &RuntimeConfig,
) -> (EvalStats, usize, Vec<Value>) {
    let lengths: Vec<usize> = inputs.iter().map(Input::len).collect();
    let count = match (count, lengths.iter().min()) {
        (Some(count), _) => count,
        (None, Some(&len)) => {
            if lengths.iter().any(|&l| l != len) {
                fail("Error", format!("Input lengths differ: {:?}", lengths));
            }
            len
        }
        (None, None) => 1,
    };
    let len = if expr.reduction().is_some() { 1 } else { count.max(1) };
    let mut out = Column::zeros(expr.output_dtype(), len)
        .unwrap_or_else(|| fail("Error", format!("Cannot allocate {} output", expr.output_dtype())));
    let stats = {
        let mut view = out
            .as_output()
            .unwrap_or_else(|| fail("Error", "output column is not writable"));
        expr.evaluate_with(inputs, &mut view, count, runtime)
            .unwrap_or_else(|e| fail("Evaluation error", e))
    };
    let mut values = out.values();
    values.truncate(if expr.reduction().is_some() { 1 } else { count });
    (stats, count, values)
}

fn evaluate_nd(
    expr: &CompiledExpr,
    inputs: &[Input<'_>],
    geometry: &ChunkGeometry,
    chunk: u64,
    block: u64,
    runtime: &RuntimeConfig,
) -> (EvalStats, usize, Vec<Value>) {
    let items = geometry.block_items();
    let valid = expr
        .valid_item_count(chunk, block)
        .unwrap_or_else(|e| fail("Evaluation error", e));
    let mut out = Column::zeros(expr.output_dtype(), items)
        .unwrap_or_else(|| fail("Error", format!("Cannot allocate {} output", expr.output_dtype())));
    let stats = {
        let mut view = out
            .as_output()
            .unwrap_or_else(|| fail("Error", "output column is not writable"));
        expr.evaluate_nd_with(inputs, &mut view, items, chunk, block, runtime)
            .unwrap_or_else(|e| fail("Evaluation error", e))
    };
    let mut values = out.values();
    if expr.reduction().is_some() {
        values.truncate(1);
    }
    (stats, valid, values)
}

fn print_results(expr: &CompiledExpr, stats: &EvalStats, valid_items: usize, values: &[Value], verbose: bool) {
    println!("{}", "Evaluation Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    println!("{}: {}", "Output dtype".cyan(), expr.output_dtype());
    println!("{}: {}", "Engine".cyan(), stats.engine);
    if let Some(kind) = expr.reduction() {
        println!("{}: {}", "Reduction".cyan(), kind);
    }
    println!("{}: {}", "Valid items".cyan(), valid_items);
    if verbose {
        println!("{}: {}", "Scratch items".cyan(), stats.scratch_items);
        let names: Vec<String> = expr
            .variables()
            .iter()
            .map(|v| format!("{}: {}", v.name, v.dtype))
            .collect();
        println!("{}: {}", "Variables".cyan(), names.join(", "));
    }
    println!();

    let rendered: Vec<String> = values.iter().map(Value::to_string).collect();
    println!("[{}]", rendered.join(", "));
}
