use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use orca::config::EngineConfig;
use orca::ir::search::find_declarations;
use orca::ir::{Module, Verifier, parse_module};
use orca::jit::{Engine, SymbolFlags};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum LogLevelArg {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevelArg {
    fn directive(self) -> &'static str {
        match self {
            LogLevelArg::Error => "error",
            LogLevelArg::Warn => "warn",
            LogLevelArg::Info => "info",
            LogLevelArg::Debug => "debug",
            LogLevelArg::Trace => "trace",
        }
    }
}

#[derive(Parser)]
#[command(name = "orca")]
#[command(about = "JIT compile, link and run IR modules", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of compile worker threads
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Log every published symbol
    #[arg(long, global = true)]
    trace_jit: bool,

    /// Do not resolve symbols from the host process
    #[arg(long, global = true)]
    no_process_symbols: bool,

    /// Log level (RUST_LOG overrides)
    #[arg(long, global = true, value_enum, default_value = "warn")]
    log_level: LogLevelArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a module and call one of its functions
    Run {
        /// The module file to run
        file: PathBuf,

        /// Function to call
        #[arg(long, default_value = "main")]
        entry: String,

        /// Integer arguments passed to the entry function
        #[arg(trailing_var_arg = true, allow_negative_numbers = true)]
        args: Vec<i64>,
    },
    /// Parse and verify a module without compiling it
    Check {
        /// The module file to check
        file: PathBuf,
    },
    /// Compile and link a module, then list the symbols it published
    Symbols {
        /// The module file to link
        file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Find declarations of a (possibly module-qualified) name
    Find {
        /// The module file to search
        file: PathBuf,

        /// Name to find, e.g. `add` or `n::m::add`
        name: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.directive())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Run { file, entry, args } => run(&file, &entry, &args, config),
        Commands::Check { file } => check(&file, &config),
        Commands::Symbols { file, json } => symbols(&file, json, config),
        Commands::Find { file, name } => find(&file, &name),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Read the config file, if any, then apply command-line overrides.
fn load_config(cli: &Cli) -> Result<EngineConfig, String> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.compile_workers = Some(workers);
    }
    if cli.trace_jit {
        config.trace_jit = true;
    }
    if cli.no_process_symbols {
        config.process_symbols = false;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn read_module(file: &Path) -> Result<Module, String> {
    let source = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
    parse_module(&source).map_err(|e| format!("{}:{}", file.display(), e))
}

fn run(file: &Path, entry: &str, args: &[i64], config: EngineConfig) -> Result<(), String> {
    let module = read_module(file)?;
    let function = module
        .function(entry)
        .ok_or_else(|| format!("module `{}` has no function `{}`", module.name(), entry))?;
    if !function.is_exported() {
        return Err(format!("function `{}` is not exported", entry));
    }
    if function.params.len() != args.len() {
        return Err(format!(
            "function `{}` takes {} arguments, {} given",
            entry,
            function.params.len(),
            args.len()
        ));
    }

    let engine = Engine::with_config(config).map_err(|e| e.to_string())?;
    engine.add_module_blocking(module).map_err(|e| e.to_string())?;
    let address = engine.get_symbol_address(entry).map_err(|e| e.to_string())?;

    let result = unsafe { call_entry(address, args) }?;
    println!("{}", result);
    Ok(())
}

/// Call a JIT-compiled `extern "C" fn(i64, ...) -> i64`.
///
/// # Safety
/// `address` must be a function taking exactly `args.len()` integers.
unsafe fn call_entry(address: u64, args: &[i64]) -> Result<i64, String> {
    type F0 = extern "C" fn() -> i64;
    type F1 = extern "C" fn(i64) -> i64;
    type F2 = extern "C" fn(i64, i64) -> i64;
    type F3 = extern "C" fn(i64, i64, i64) -> i64;
    type F4 = extern "C" fn(i64, i64, i64, i64) -> i64;
    type F5 = extern "C" fn(i64, i64, i64, i64, i64) -> i64;
    type F6 = extern "C" fn(i64, i64, i64, i64, i64, i64) -> i64;
    type F7 = extern "C" fn(i64, i64, i64, i64, i64, i64, i64) -> i64;
    type F8 = extern "C" fn(i64, i64, i64, i64, i64, i64, i64, i64) -> i64;

    let ptr = address as usize;
    let value = unsafe {
        match *args {
            [] => std::mem::transmute::<usize, F0>(ptr)(),
            [a] => std::mem::transmute::<usize, F1>(ptr)(a),
            [a, b] => std::mem::transmute::<usize, F2>(ptr)(a, b),
            [a, b, c] => std::mem::transmute::<usize, F3>(ptr)(a, b, c),
            [a, b, c, d] => std::mem::transmute::<usize, F4>(ptr)(a, b, c, d),
            [a, b, c, d, e] => std::mem::transmute::<usize, F5>(ptr)(a, b, c, d, e),
            [a, b, c, d, e, f] => std::mem::transmute::<usize, F6>(ptr)(a, b, c, d, e, f),
            [a, b, c, d, e, f, g] => std::mem::transmute::<usize, F7>(ptr)(a, b, c, d, e, f, g),
            [a, b, c, d, e, f, g, h] => std::mem::transmute::<usize, F8>(ptr)(a, b, c, d, e, f, g, h),
            _ => return Err(format!("at most 8 arguments supported, {} given", args.len())),
        }
    };
    Ok(value)
}

fn check(file: &Path, config: &EngineConfig) -> Result<(), String> {
    let module = read_module(file)?;
    Verifier::with_max_stack(config.max_stack)
        .verify_module(&module)
        .map_err(|e| format!("{}: {}", file.display(), e))?;
    println!(
        "{}: module `{}` ok ({} functions, {} globals)",
        file.display(),
        module.name(),
        module.functions().len(),
        module.globals().len()
    );
    Ok(())
}

#[derive(serde::Serialize)]
struct SymbolEntry<'a> {
    name: &'a str,
    address: String,
    kind: &'static str,
}

fn symbols(file: &Path, json: bool, config: EngineConfig) -> Result<(), String> {
    let module = read_module(file)?;
    let engine = Engine::with_config(config).map_err(|e| e.to_string())?;
    engine.add_module_blocking(module).map_err(|e| e.to_string())?;

    let published = engine.main_library().symbols();
    let mangler = engine.session().mangler();
    let entries: Vec<SymbolEntry<'_>> = published
        .iter()
        .map(|symbol| SymbolEntry {
            name: mangler
                .demangle(symbol.name.as_str())
                .unwrap_or(symbol.name.as_str()),
            address: format!("{:#x}", symbol.address),
            kind: if symbol.flags == SymbolFlags::FUNCTION {
                "function"
            } else {
                "data"
            },
        })
        .collect();

    if json {
        let text = serde_json::to_string_pretty(&entries).map_err(|e| e.to_string())?;
        println!("{}", text);
    } else {
        for entry in &entries {
            println!("{:<18} {:<8} {}", entry.address, entry.kind, entry.name);
        }
    }
    Ok(())
}

fn find(file: &Path, name: &str) -> Result<(), String> {
    let source = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
    let found = find_declarations(&source, name);
    if found.is_empty() {
        return Err(format!("no declaration of `{}` in {}", name, file.display()));
    }
    for (line, column) in found {
        println!("Found declaration at {}:{}", line, column);
    }
    Ok(())
}
