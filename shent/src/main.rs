//! Shent CLI - emits and simulates GC barriers.
//!
//! This is the main entry point for the shent CLI application.
//! It uses clap for argument parsing and dispatches to the command
//! handlers in [`commands`].

mod commands;
mod config;
mod error;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shen_barrier::GcState;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::common::{BarrierArg, IsaArg, OutputFormat, StrengthArg};
use commands::{run_config, run_emit, run_init, run_simulate, ConfigArgs, EmitArgs, InitArgs, SimulateArgs};
use config::Config;

/// Shent - emit and simulate concurrent-collector barriers
///
/// Shent drives the barrier emitters for AMD64 and AArch64, prints the
/// generated code and runs it against a simulated collector runtime.
#[derive(Parser, Debug)]
#[command(name = "shent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Emit and simulate GC barriers", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, env = "SHENT_VERBOSE")]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "SHENT_CONFIG")]
    config: Option<PathBuf>,

    /// Disable color output
    #[arg(long, global = true, env = "SHENT_NO_COLOR")]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands for the shent CLI.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Emit one barrier and print its listing
    Emit(EmitCommand),

    /// Run one barrier on the simulated collector runtime
    ///
    /// Every run is checked against the reference path decision; a
    /// barrier that takes a different path fails the command.
    Simulate(SimulateCommand),

    /// Write a default shent.toml
    Init(InitCommand),

    /// Print the effective configuration
    Config(ConfigCommand),
}

/// Arguments for the emit subcommand.
#[derive(Parser, Debug)]
struct EmitCommand {
    /// Barrier to emit
    #[arg(value_enum)]
    barrier: BarrierArg,

    /// Target instruction set
    #[arg(long, value_enum, default_value_t = IsaArg::Amd64)]
    isa: IsaArg,

    /// Reference strength of the load
    #[arg(short, long, value_enum, default_value_t = StrengthArg::Strong)]
    strength: StrengthArg,

    /// The slot holds a compressed reference
    #[arg(long)]
    narrow: bool,

    /// The loaded reference is known to be non-null
    #[arg(long)]
    not_null: bool,

    /// The previous value of a pre-write is known to be non-null
    #[arg(long)]
    non_null: bool,

    /// Pass stub operands in native ABI registers
    #[arg(long)]
    native_stubs: bool,

    /// Print emission statistics after the listing
    #[arg(long)]
    stats: bool,

    /// Output format
    #[arg(short = 'F', long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

/// Arguments for the simulate subcommand.
#[derive(Parser, Debug)]
struct SimulateCommand {
    /// Barrier to run (lrb, load, pre-write or array-range)
    #[arg(value_enum)]
    barrier: BarrierArg,

    /// Target instruction set
    #[arg(long, value_enum, default_value_t = IsaArg::Amd64)]
    isa: IsaArg,

    /// Published GC state, e.g. `marking` or `has_forwarded|evacuation`
    #[arg(short, long, default_value = "idle")]
    gc_state: GcState,

    /// Reference strength of the load
    #[arg(short, long, value_enum, default_value_t = StrengthArg::Strong)]
    strength: StrengthArg,

    /// The slot holds a compressed reference
    #[arg(long)]
    narrow: bool,

    /// Store null in the slot
    #[arg(long)]
    null: bool,

    /// Put the target's region in the collection set
    #[arg(long)]
    in_cset: bool,

    /// Treat the target as unreachable
    #[arg(long)]
    unreachable: bool,

    /// Number of runs, or the array length for array-range
    #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=100_000))]
    count: u32,

    /// Pass stub operands in native ABI registers
    #[arg(long)]
    native_stubs: bool,

    /// Output format
    #[arg(short = 'F', long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

/// Arguments for the init subcommand.
#[derive(Parser, Debug)]
struct InitCommand {
    /// Directory to write into (default: current directory)
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Overwrite an existing shent.toml
    #[arg(short, long)]
    force: bool,
}

/// Arguments for the config subcommand.
#[derive(Parser, Debug)]
struct ConfigCommand {
    /// Print JSON instead of TOML
    #[arg(long)]
    json: bool,
}

/// Main entry point for the shent CLI.
///
/// Parses command-line arguments, initializes logging, loads configuration,
/// and dispatches to the appropriate command handler.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.no_color)?;

    let config = load_config(cli.config.as_deref())?;

    execute_command(cli.command, config)
}

/// Initialize the logging system.
///
/// Logs go to stderr so listings and JSON on stdout stay clean. Records
/// from the `log` facade used by the barrier crates are forwarded too.
fn init_logging(verbose: bool, no_color: bool) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    let subscriber = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(!no_color)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Load configuration from file or use defaults, then apply the
/// environment overrides.
fn load_config(config_path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let config = match config_path {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    Ok(config.finalize()?)
}

/// Execute the selected command.
fn execute_command(command: Commands, config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Emit(args) => run_emit(args.into(), &config).context("emit failed")?,
        Commands::Simulate(args) => run_simulate(args.into(), &config).context("simulate failed")?,
        Commands::Init(args) => {
            let init_args = InitArgs { path: args.path, force: args.force };
            run_init(init_args, &config).context("init failed")?
        }
        Commands::Config(args) => {
            let format = if args.json { OutputFormat::Json } else { OutputFormat::Text };
            run_config(ConfigArgs { format }, &config)?
        }
    }
    Ok(())
}

impl From<EmitCommand> for EmitArgs {
    fn from(args: EmitCommand) -> Self {
        Self {
            isa: args.isa,
            barrier: args.barrier,
            strength: args.strength,
            narrow: args.narrow,
            not_null: args.not_null,
            non_null: args.non_null,
            native_stubs: args.native_stubs,
            stats: args.stats,
            format: args.format,
        }
    }
}

impl From<SimulateCommand> for SimulateArgs {
    fn from(args: SimulateCommand) -> Self {
        Self {
            isa: args.isa,
            barrier: args.barrier,
            strength: args.strength,
            gc_state: args.gc_state,
            narrow: args.narrow,
            null: args.null,
            in_cset: args.in_cset,
            unreachable: args.unreachable,
            count: args.count as usize,
            native_stubs: args.native_stubs,
            format: args.format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_emit() {
        let cli = Cli::parse_from(["shent", "emit", "lrb"]);
        if let Commands::Emit(args) = cli.command {
            assert_eq!(args.barrier, BarrierArg::Lrb);
            assert_eq!(args.isa, IsaArg::Amd64);
            assert_eq!(args.format, OutputFormat::Text);
        } else {
            panic!("Expected Emit command");
        }
    }

    #[test]
    fn test_cli_parse_emit_with_options() {
        let cli = Cli::parse_from([
            "shent", "emit", "pre-write", "--isa", "aarch64", "--non-null", "--native-stubs", "-F", "json",
        ]);
        if let Commands::Emit(args) = cli.command {
            let args = EmitArgs::from(args);
            assert_eq!(args.barrier, BarrierArg::PreWrite);
            assert_eq!(args.isa, IsaArg::Aarch64);
            assert!(args.non_null);
            assert!(args.native_stubs);
            assert_eq!(args.format, OutputFormat::Json);
        } else {
            panic!("Expected Emit command");
        }
    }

    #[test]
    fn test_cli_parse_emit_strength() {
        let cli = Cli::parse_from(["shent", "emit", "load", "--strength", "phantom", "--narrow"]);
        if let Commands::Emit(args) = cli.command {
            assert_eq!(args.strength, StrengthArg::Phantom);
            assert!(args.narrow);
        } else {
            panic!("Expected Emit command");
        }
    }

    #[test]
    fn test_cli_rejects_unknown_barrier() {
        assert!(Cli::try_parse_from(["shent", "emit", "post-write"]).is_err());
    }

    #[test]
    fn test_cli_parse_simulate() {
        let cli = Cli::parse_from([
            "shent", "simulate", "lrb", "--gc-state", "has_forwarded|evacuation", "--in-cset", "-n", "3",
        ]);
        if let Commands::Simulate(args) = cli.command {
            let args = SimulateArgs::from(args);
            assert_eq!(args.gc_state, GcState::HAS_FORWARDED | GcState::EVACUATION);
            assert!(args.in_cset);
            assert_eq!(args.count, 3);
        } else {
            panic!("Expected Simulate command");
        }
    }

    #[test]
    fn test_cli_parse_simulate_defaults_to_idle() {
        let cli = Cli::parse_from(["shent", "simulate", "pre-write"]);
        if let Commands::Simulate(args) = cli.command {
            assert_eq!(args.gc_state, GcState::IDLE);
            assert_eq!(args.count, 1);
        } else {
            panic!("Expected Simulate command");
        }
    }

    #[test]
    fn test_cli_rejects_bad_gc_state() {
        assert!(Cli::try_parse_from(["shent", "simulate", "lrb", "--gc-state", "sweeping"]).is_err());
    }

    #[test]
    fn test_cli_rejects_zero_count() {
        assert!(Cli::try_parse_from(["shent", "simulate", "lrb", "-n", "0"]).is_err());
    }

    #[test]
    fn test_cli_parse_init_with_force() {
        let cli = Cli::parse_from(["shent", "init", "--path", "/tmp/test", "--force"]);
        if let Commands::Init(args) = cli.command {
            assert_eq!(args.path, Some(PathBuf::from("/tmp/test")));
            assert!(args.force);
        } else {
            panic!("Expected Init command");
        }
    }

    #[test]
    fn test_cli_parse_config_json() {
        let cli = Cli::parse_from(["shent", "config", "--json"]);
        assert!(matches!(cli.command, Commands::Config(ConfigCommand { json: true })));
    }

    #[test]
    fn test_cli_parse_global_flags() {
        let cli = Cli::parse_from(["shent", "--verbose", "--no-color", "--config", "/path/shent.toml", "config"]);
        assert!(cli.verbose);
        assert!(cli.no_color);
        assert_eq!(cli.config, Some(PathBuf::from("/path/shent.toml")));
    }
}
