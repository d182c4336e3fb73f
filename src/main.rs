//! DAP Harness - drives debug adapters from the command line
//!
//! Launches programs under a Debug Adapter Protocol adapter, shows where
//! they stop and runs YAML scenarios that assert on variable trees.

use std::path::PathBuf;

use clap::Parser;
use dap_harness::common::{config::Config, logging};
use dap_harness::{cli, commands::Commands};

#[derive(Parser)]
#[command(name = "dap-harness", about = "Debug adapter test harness")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write a full trace of the session to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match &cli.log_file {
        Some(path) => match logging::init_file(path) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Error: cannot open log file '{}': {e}", path.display());
                std::process::exit(1);
            }
        },
        None => {
            logging::init_cli();
            None
        }
    };

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    let result = match config {
        Ok(config) => cli::dispatch(cli.command, config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
