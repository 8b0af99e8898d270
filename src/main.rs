use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use cadence::vm::bytecode;
use cadence::vm::{DataType, FunctionDescriptor, Op, Primitive};
use cadence::{
    Context, Engine, EngineConfig, ExecutionOutcome, FunctionBuilder, Module, ModuleImage,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Run and inspect cadence module images", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log engine activity at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a function of a module image
    Run {
        /// The module image to run
        image: PathBuf,

        /// Entry function name
        #[arg(long, default_value = "main")]
        entry: String,

        /// Argument for the entry function; repeat for each parameter
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Additional module images whose functions the main image imports
        #[arg(long = "with")]
        with: Vec<PathBuf>,

        /// Abort execution after this many seconds (0 = no timeout)
        #[arg(long, default_value = "0")]
        timeout: u64,
    },
    /// Print the instructions of every function in a module image, or of a
    /// binary code blob written by `encode`
    Disasm {
        /// The module image or code blob to disassemble
        image: PathBuf,
    },
    /// Write the binary encoding of one function's code
    Encode {
        /// The module image holding the function
        image: PathBuf,

        /// Function to encode
        #[arg(long, default_value = "main")]
        function: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Build a module image with the verifier enabled
    Verify {
        /// The module image to verify
        image: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };

    let result = match cli.command {
        Commands::Run {
            image,
            entry,
            args,
            with,
            timeout,
        } => run(config, &image, &with, &entry, &args, timeout),
        Commands::Disasm { image } => disasm(config, &image),
        Commands::Encode {
            image,
            function,
            output,
        } => encode(config, &image, &function, &output),
        Commands::Verify { image } => verify(config, &image),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Registers the host functions available to images run from the CLI.
fn register_builtins(engine: &Engine) {
    engine.register_function(
        FunctionBuilder::system("print_int").param(DataType::INT).build(),
        |call| {
            println!("{}", call.arg_int(0));
            Ok(())
        },
    );
    engine.register_function(
        FunctionBuilder::system("print_double")
            .param(DataType::DOUBLE)
            .build(),
        |call| {
            println!("{}", call.arg_double(0));
            Ok(())
        },
    );
    engine.register_function(
        FunctionBuilder::system("print_bool").param(DataType::BOOL).build(),
        |call| {
            println!("{}", call.arg_bool(0));
            Ok(())
        },
    );
}

fn load(engine: &Arc<Engine>, path: &PathBuf) -> Result<Arc<Module>, String> {
    let image = ModuleImage::load(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    image
        .build(engine)
        .map_err(|e| format!("{}: {}", path.display(), e))
}

fn run(
    config: EngineConfig,
    path: &PathBuf,
    with: &[PathBuf],
    entry: &str,
    args: &[String],
    timeout: u64,
) -> Result<ExitCode, String> {
    let engine = Engine::new(config);
    register_builtins(&engine);

    let mut modules = Vec::with_capacity(with.len() + 1);
    for dependency in with {
        modules.push(load(&engine, dependency)?);
    }
    let main = load(&engine, path)?;
    modules.push(Arc::clone(&main));

    for module in &modules {
        if module.import_count() > 0 {
            engine
                .bind_all_imported_functions(module)
                .map_err(|e| format!("{}: {}", module.name(), e))?;
        }
    }
    for module in &modules {
        engine
            .reset_globals(module)
            .map_err(|e| format!("{}: {}", module.name(), e))?;
    }

    let function = main
        .function_by_name(entry)
        .cloned()
        .ok_or_else(|| format!("no function named '{}'", entry))?;

    let mut ctx = engine.create_context();
    ctx.prepare(function.id).map_err(|e| e.to_string())?;
    set_args(&mut ctx, &function, args)?;

    // A watchdog aborts the context once the timeout elapses.
    let done = if timeout > 0 {
        let handle = ctx.interrupt_handle();
        let (tx, rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            if rx.recv_timeout(Duration::from_secs(timeout)).is_err() {
                handle.abort();
            }
        });
        Some(tx)
    } else {
        None
    };

    let outcome = ctx.execute().map_err(|e| e.to_string())?;
    drop(done);

    match outcome {
        ExecutionOutcome::Finished => {
            print_return(&ctx, &function);
            Ok(ExitCode::SUCCESS)
        }
        ExecutionOutcome::Exception => {
            let info = ctx.exception_info();
            let message = info.map_or("unknown exception", |e| e.message.as_str());
            let function = info.map_or("?", |e| e.function_name.as_str());
            match info.map_or((0, 0), |e| (e.line, e.column)) {
                (0, _) => eprintln!("error: {} in {}", message, function),
                (line, 0) => eprintln!("error: {} in {} at line {}", message, function, line),
                (line, column) => {
                    eprintln!("error: {} in {} at {}:{}", message, function, line, column)
                }
            }
            Ok(ExitCode::FAILURE)
        }
        ExecutionOutcome::Aborted => {
            eprintln!("error: execution timed out after {} seconds", timeout);
            Ok(ExitCode::FAILURE)
        }
        ExecutionOutcome::Suspended => {
            eprintln!("error: execution suspended");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn set_args(ctx: &mut Context, function: &FunctionDescriptor, args: &[String]) -> Result<(), String> {
    let params = &function.signature.params;
    if args.len() != params.len() {
        return Err(format!(
            "{} expects {} argument(s), got {}",
            function.declaration(),
            params.len(),
            args.len()
        ));
    }
    for (index, (param, text)) in params.iter().zip(args).enumerate() {
        let bad = || format!("argument {}: cannot parse '{}' as {}", index, text, param.ty);
        let result = match param.ty.primitive_kind() {
            Some(Primitive::Bool) => {
                let value: bool = text.parse().map_err(|_| bad())?;
                ctx.set_arg_byte(index, value as u8)
            }
            Some(Primitive::Int8 | Primitive::Int16 | Primitive::Int32) => {
                let value: i32 = text.parse().map_err(|_| bad())?;
                match param.ty.size_in_bytes() {
                    1 => ctx.set_arg_byte(index, value as u8),
                    2 => ctx.set_arg_word(index, value as u16),
                    _ => ctx.set_arg_dword(index, value as u32),
                }
            }
            Some(Primitive::UInt8 | Primitive::UInt16 | Primitive::UInt32) => {
                let value: u32 = text.parse().map_err(|_| bad())?;
                match param.ty.size_in_bytes() {
                    1 => ctx.set_arg_byte(index, value as u8),
                    2 => ctx.set_arg_word(index, value as u16),
                    _ => ctx.set_arg_dword(index, value),
                }
            }
            Some(Primitive::Int64) => {
                let value: i64 = text.parse().map_err(|_| bad())?;
                ctx.set_arg_qword(index, value as u64)
            }
            Some(Primitive::UInt64) => {
                let value: u64 = text.parse().map_err(|_| bad())?;
                ctx.set_arg_qword(index, value)
            }
            Some(Primitive::Float) => {
                let value: f32 = text.parse().map_err(|_| bad())?;
                ctx.set_arg_float(index, value)
            }
            Some(Primitive::Double) => {
                let value: f64 = text.parse().map_err(|_| bad())?;
                ctx.set_arg_double(index, value)
            }
            _ => return Err(format!("argument {}: {} cannot be passed from the command line", index, param.ty)),
        };
        result.map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn print_return(ctx: &Context, function: &FunctionDescriptor) {
    let ty = &function.signature.return_type;
    if ty.is_reference || ty.is_object() {
        return;
    }
    match ty.primitive_kind() {
        Some(Primitive::Bool) => println!("{}", ctx.return_byte() != 0),
        Some(Primitive::Int8) => println!("{}", ctx.return_byte() as i8),
        Some(Primitive::Int16) => println!("{}", ctx.return_word() as i16),
        Some(Primitive::Int32) => println!("{}", ctx.return_dword() as i32),
        Some(Primitive::UInt8) => println!("{}", ctx.return_byte()),
        Some(Primitive::UInt16) => println!("{}", ctx.return_word()),
        Some(Primitive::UInt32) => println!("{}", ctx.return_dword()),
        Some(Primitive::Int64) => println!("{}", ctx.return_qword() as i64),
        Some(Primitive::UInt64) => println!("{}", ctx.return_qword()),
        Some(Primitive::Float) => println!("{}", ctx.return_float()),
        Some(Primitive::Double) => println!("{}", ctx.return_double()),
        Some(Primitive::Void) | None => {}
    }
}

fn print_code(code: &[Op], line_of: impl Fn(usize) -> Option<u32>) {
    for (pc, op) in code.iter().enumerate() {
        let line = line_of(pc)
            .map(|line| format!("{:>4}", line))
            .unwrap_or_else(|| "    ".to_string());
        println!("  {:04} {} {:?}", pc, line, op);
    }
}

fn disasm(config: EngineConfig, path: &PathBuf) -> Result<ExitCode, String> {
    let data = std::fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    if bytecode::is_blob(&data) {
        let code = bytecode::deserialize(&data).map_err(|e| format!("{}: {}", path.display(), e))?;
        println!("{}:", path.display());
        print_code(&code, |_| None);
        return Ok(ExitCode::SUCCESS);
    }

    let engine = Engine::new(EngineConfig {
        verify_bytecode: false,
        ..config
    });
    register_builtins(&engine);
    let module = load(&engine, path)?;

    let functions = module.functions().chain(module.init_function());
    for function in functions {
        println!("{}:", function.declaration());
        print_code(&function.code, |pc| {
            function
                .lines
                .entries()
                .iter()
                .find(|e| e.pc as usize == pc)
                .map(|e| e.line)
        });
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

/// Operands hold the engine ids assigned while loading, not image indices.
fn encode(
    config: EngineConfig,
    path: &PathBuf,
    name: &str,
    output: &PathBuf,
) -> Result<ExitCode, String> {
    let engine = Engine::new(config);
    register_builtins(&engine);
    let module = load(&engine, path)?;
    let function = module
        .function_by_name(name)
        .ok_or_else(|| format!("no function named '{}'", name))?;
    let blob = bytecode::serialize(&function.code);
    std::fs::write(output, &blob).map_err(|e| format!("{}: {}", output.display(), e))?;
    println!(
        "{}: {} instruction(s), {} bytes",
        function.declaration(),
        function.code.len(),
        blob.len()
    );
    Ok(ExitCode::SUCCESS)
}

fn verify(config: EngineConfig, path: &PathBuf) -> Result<ExitCode, String> {
    let engine = Engine::new(EngineConfig {
        verify_bytecode: true,
        ..config
    });
    register_builtins(&engine);
    let module = load(&engine, path)?;
    println!(
        "{}: {} function(s) verified",
        module.name(),
        module.function_count()
    );
    Ok(ExitCode::SUCCESS)
}
