//! tpi - drive the translation-time plugin layer without a full emulator
//!
//! # Usage
//!
//! ```bash
//! # Load a plugin, print its descriptor and ABI warnings
//! tpi inspect icount --guest lm32 --mode softmmu
//!
//! # Translate two synthetic blocks and run them 1000 times on 4 vCPUs
//! tpi replay profile --block 0x1000:4:16 --block 0x2000:2:8 --cpus 4 --rounds 1000
//!
//! # Same, with engine diagnostics
//! tpi --log-level debug replay profile --block 0x1000:4:16
//! ```
//!
//! The usual `TPI_*` environment variables apply (`TPI_OUTPUT`, `TPI_LOW_PC`,
//! `TPI_HIGH_PC`, `TPI_MUTEX_PROTECTED`, `TPI_VERBOSE`, `TPI_PLUGIN_DIR`).

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use std::process;
use std::thread;

use tpi_engine::config::parse_c_integer;
use tpi_engine::{
    BlockRunner, BlockTranslator, EngineConfig, EngineInfo, GeneratedBlock, GuestInsn,
    PluginRegistry,
};

#[derive(Parser)]
#[command(name = "tpi")]
#[command(version = "0.1.0")]
#[command(about = "Translation-time plugin instrumentation driver", long_about = None)]
struct Cli {
    /// Engine log level (overrides RUST_LOG)
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load a plugin with verbose diagnostics and report its activation
    Inspect {
        /// Plugin path or short name (e.g. "icount")
        plugin: String,

        /// Guest architecture the engine emulates
        #[arg(long, default_value = "lm32")]
        guest: String,

        /// Emulation mode of the engine
        #[arg(long, default_value = "softmmu")]
        mode: String,

        /// Number of virtual CPUs
        #[arg(long, default_value = "1")]
        cpus: u32,
    },

    /// Translate synthetic blocks and replay them on several virtual CPUs
    Replay {
        /// Plugin path or short name (e.g. "icount")
        plugin: String,

        /// Block as PC:ICOUNT:SIZE, repeatable
        #[arg(long = "block", required = true, value_parser = parse_block)]
        blocks: Vec<BlockSpec>,

        /// Guest architecture the engine emulates
        #[arg(long, default_value = "lm32")]
        guest: String,

        /// Emulation mode of the engine
        #[arg(long, default_value = "softmmu")]
        mode: String,

        /// Number of virtual CPUs, one thread each
        #[arg(long, default_value = "1")]
        cpus: u32,

        /// Executions of every block on every vCPU
        #[arg(long, default_value = "1")]
        rounds: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockSpec {
    pc: u64,
    icount: u16,
    size: u16,
}

fn parse_block(text: &str) -> Result<BlockSpec, String> {
    let fields: Vec<&str> = text.split(':').collect();
    let &[pc, icount, size] = fields.as_slice() else {
        return Err(format!("expected PC:ICOUNT:SIZE, got '{}'", text));
    };

    let pc = parse_c_integer(pc).ok_or_else(|| format!("invalid block address '{}'", pc))?;
    let icount: u16 = icount
        .parse()
        .map_err(|_| format!("invalid instruction count '{}'", icount))?;
    let size: u16 = size
        .parse()
        .map_err(|_| format!("invalid block size '{}'", size))?;
    if icount == 0 || size < icount {
        return Err(format!(
            "block at {:#x} needs at least one byte per instruction",
            pc
        ));
    }
    Ok(BlockSpec { pc, icount, size })
}

fn main() {
    let cli = Cli::parse();
    match cli.log_level {
        Some(level) => tpi_engine::logging::init_with_level(level.into()),
        None => tpi_engine::logging::init_from_env(),
    }

    let result = match cli.command {
        Commands::Inspect {
            plugin,
            guest,
            mode,
            cpus,
        } => inspect(&plugin, EngineInfo::new(guest, mode).with_cpus(cpus)),
        Commands::Replay {
            plugin,
            blocks,
            guest,
            mode,
            cpus,
            rounds,
        } => replay(
            &plugin,
            EngineInfo::new(guest, mode).with_cpus(cpus),
            &blocks,
            rounds,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load(plugin: &str, config: EngineConfig, engine: EngineInfo) -> Result<PluginRegistry, String> {
    let mut registry = PluginRegistry::new(config, engine);
    let activation = registry.load(plugin).map_err(|e| e.to_string())?;
    for warning in &activation.warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(registry)
}

fn inspect(plugin: &str, engine: EngineInfo) -> Result<(), String> {
    let config = EngineConfig {
        verbose: true,
        ..EngineConfig::from_env()
    };
    let registry = load(plugin, config, engine)?;

    let class = match registry.activation() {
        Some(activation) if activation.is_generic() => "generic",
        Some(_) => "architecture specific",
        None => "inactive",
    };
    println!(
        "{}: {} plugin, range {}, output {}",
        registry.module_name().unwrap_or(plugin),
        class,
        registry.dispatcher().range(),
        registry
            .output()
            .map(|output| output.destination().to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    Ok(())
}

fn replay(
    plugin: &str,
    engine: EngineInfo,
    blocks: &[BlockSpec],
    rounds: u64,
) -> Result<(), String> {
    let nb_cpus = engine.nb_cpus;
    let registry = load(plugin, EngineConfig::from_env(), engine)?;

    let translator = BlockTranslator::new(registry.dispatcher());
    let per_cpu = (0..nb_cpus)
        .map(|cpu| {
            blocks
                .iter()
                .map(|block| {
                    let insns = GuestInsn::straight_line(block.pc, block.icount, block.size);
                    translator
                        .translate(cpu, block.pc, &insns)
                        .map_err(|e| format!("block {:#x}: {}", block.pc, e))
                })
                .collect::<Result<Vec<GeneratedBlock>, String>>()
        })
        .collect::<Result<Vec<_>, String>>()?;

    let helper_calls: u64 = thread::scope(|scope| {
        let handles: Vec<_> = per_cpu
            .iter()
            .map(|code| {
                let registry = &registry;
                scope.spawn(move || {
                    let mut runner = BlockRunner::new(registry);
                    for _ in 0..rounds {
                        for block in code {
                            runner.run(block);
                        }
                    }
                    runner.helper_calls()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(0))
            .sum()
    });

    registry.cpus_stopped();
    log::info!(
        "replayed {} block(s) on {} vCPU(s), {} helper call(s), {} skipped",
        blocks.len(),
        nb_cpus,
        helper_calls,
        registry.guard().skipped()
    );
    Ok(())
}
