//! pinwheeld — the pinwheel daemon.
//!
//! One binary, two roles:
//! - `conductor`: mapping state store and reconciliation RPC
//! - `agent`: per-host resource tracker, pin executor, and event dispatcher
//!
//! # Usage
//!
//! ```text
//! pinwheeld --config /etc/pinwheel/pinwheel.toml conductor
//! pinwheeld --config /etc/pinwheel/pinwheel.toml agent
//! pinwheeld compile 0-3,^2 --cpus 8
//! ```

mod agent_mode;
mod conductor_mode;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use pinwheel_core::PinwheelConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "pinwheeld", about = "pinwheel vCPU pinning daemon")]
struct Cli {
    /// Path to pinwheel.toml. Built-in defaults are used when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the conductor (mapping store and reconciliation).
    Conductor,

    /// Run the host agent.
    Agent,

    /// Compile a CPU range specification and print the bitmap.
    Compile {
        spec: String,

        /// Host CPU count to compile against.
        #[arg(long)]
        cpus: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = match &cli.config {
        Some(path) => {
            let config = PinwheelConfig::from_file(path)?;
            info!(path = ?path, "configuration loaded");
            config
        }
        None => PinwheelConfig::default(),
    };

    match cli.command {
        Command::Conductor => conductor_mode::run_conductor(config).await,
        Command::Agent => agent_mode::run_agent(config).await,
        Command::Compile { spec, cpus } => {
            let map = pinwheel_core::compile(&spec, cpus)?;
            println!("{map}");
            println!("cpulist: {}", map.to_cpulist());
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pinwheel=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
