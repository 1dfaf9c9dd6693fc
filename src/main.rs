use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use kiln::jit::abi::{HOST, SYSV, WIN64};
use kiln::vm::bytecode::disassemble;
use kiln::{JitCompiler, JitConfig, JitMode, Program, ProgramFile};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitModeArg {
    Off,
    On,
    Auto,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Auto => JitMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AbiArg {
    Sysv,
    Win64,
}

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "x86-64 code generator for stack bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a program file and print its bytecode and generated code
    Compile {
        /// Program file (TOML)
        file: PathBuf,

        /// Code generator configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Call the fallback routine for every opcode
        #[arg(long)]
        no_inline: bool,

        /// Trace every translated instruction
        #[arg(long)]
        trace_jit: bool,

        /// Print the translation statistics as JSON
        #[arg(long)]
        json: bool,

        /// Calling convention to generate for (defaults to the host's)
        #[arg(long, value_enum)]
        abi: Option<AbiArg>,
    },
    /// Run a program file
    Run {
        /// Program file (TOML)
        file: PathBuf,

        /// Code generator configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Execution mode (off, on, auto); overrides the configuration
        #[arg(long, value_enum)]
        mode: Option<JitModeArg>,

        /// Call the fallback routine for every opcode
        #[arg(long)]
        no_inline: bool,

        /// Trace every translated instruction
        #[arg(long)]
        trace_jit: bool,

        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(trace_jit: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if trace_jit {
        EnvFilter::new("kiln=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>, no_inline: bool, trace_jit: bool) -> Result<JitConfig, String> {
    let mut config = match path {
        Some(path) => JitConfig::load(path)?,
        None => JitConfig::default(),
    };
    if no_inline {
        config.inline_fast_paths = false;
    }
    config.trace |= trace_jit;
    Ok(config)
}

fn load_program(path: &Path) -> Result<Program, String> {
    ProgramFile::load(path)?
        .assemble()
        .map_err(|e| format!("{}: {}", path.display(), e))
}

fn compile(
    file: &Path,
    config: JitConfig,
    json: bool,
    abi: Option<AbiArg>,
) -> Result<(), String> {
    let program = load_program(file)?;
    let cc = match abi {
        Some(AbiArg::Sysv) => SYSV,
        Some(AbiArg::Win64) => WIN64,
        None => HOST,
    };
    let translation = JitCompiler::with_convention(config, cc)
        .translate(&program.name, &program.code)
        .map_err(|e| format!("{}: {}", program.name, e))?;

    if json {
        let out = serde_json::to_string_pretty(&translation).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }
    let stats = translation.stats;
    println!(
        "{}: {} bytes ({}), {} instructions, {} inlined, {} fallback calls",
        translation.name,
        stats.code_size,
        translation.convention,
        stats.instructions,
        stats.inlined,
        stats.fallback_calls
    );
    print!("{}", disassemble(&program.code));
    print!("{}", translation.hex_dump());
    Ok(())
}

fn run(file: &Path, config: JitConfig, json: bool) -> Result<(), String> {
    let program = load_program(file)?;
    let execution = kiln::execute(&program, &config)?;

    if json {
        let out = serde_json::to_string_pretty(&execution).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }
    println!("stack: [{}]", execution.stack.join(", "));
    if let Some(value) = &execution.return_value {
        println!("return: {}", value);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile {
            file,
            config,
            no_inline,
            trace_jit,
            json,
            abi,
        } => {
            init_logging(trace_jit);
            load_config(config.as_deref(), no_inline, trace_jit)
                .and_then(|config| compile(&file, config, json, abi))
        }
        Commands::Run {
            file,
            config,
            mode,
            no_inline,
            trace_jit,
            json,
        } => {
            init_logging(trace_jit);
            load_config(config.as_deref(), no_inline, trace_jit).and_then(|mut config| {
                if let Some(mode) = mode {
                    config.mode = mode.into();
                }
                run(&file, config, json)
            })
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
