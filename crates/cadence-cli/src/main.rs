//! Cadence CLI
//!
//! Drives cooperative workers from the command line: a process-tree demo
//! workload and a dispatch-latency probe.

mod commands;
mod output;

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cooperative worker runtime driver", long_about = None)]
#[command(version)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Color output: auto, always, never
    #[arg(long, global = true)]
    color: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tree of demo processes across a pool of workers
    Run {
        /// Config file (cadence.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of owned worker threads (default: CPU count)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Number of root processes
        #[arg(short, long, default_value_t = 4)]
        processes: usize,
        /// Depth of each process tree
        #[arg(short, long, default_value_t = 3)]
        depth: u32,
        /// Maximum simulated work per process, in milliseconds
        #[arg(long, default_value_t = 5)]
        delay_ms: u64,
        /// Override the worker quantum, in milliseconds
        #[arg(long)]
        quantum_ms: Option<u64>,
    },

    /// Measure cross-thread dispatch latency and idle wake-up spacing
    Latency {
        /// Config file (cadence.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of samples per measurement
        #[arg(short, long, default_value_t = 1000)]
        samples: usize,
        /// Override the worker quantum, in milliseconds
        #[arg(long)]
        quantum_ms: Option<u64>,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let color = output::resolve_color_choice(cli.color.as_deref());

    match cli.command {
        Commands::Run {
            config,
            workers,
            processes,
            depth,
            delay_ms,
            quantum_ms,
        } => {
            let config = commands::load_config(config.as_deref(), quantum_ms)?;
            commands::run::execute(
                commands::run::RunArgs {
                    config,
                    workers: workers.unwrap_or_else(num_cpus::get),
                    processes,
                    depth,
                    delay_ms,
                },
                color,
            )
        }

        Commands::Latency {
            config,
            samples,
            quantum_ms,
        } => {
            let config = commands::load_config(config.as_deref(), quantum_ms)?;
            commands::latency::execute(config, samples, color)
        }
    }
}
