//! CLI command definitions
//!
//! Defines the clap commands for the harness CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Print a launch document with every reference expanded
    Expand {
        /// Path to the launch document (JSON)
        launch: PathBuf,
    },

    /// Launch a program under the adapter, report each stop and resume until it exits
    Run {
        /// Path to the launch document (JSON)
        launch: PathBuf,

        /// Attach instead of launching, whatever the document says
        #[arg(long)]
        attach: bool,

        /// Extra breakpoint(s) (file:line or function name)
        /// Can be specified multiple times: --break main --break src/file.c:42
        #[arg(long = "break", short = 'b')]
        breakpoints: Vec<String>,

        /// How many levels of each local to print
        #[arg(long, default_value_t = 2)]
        depth: usize,
    },

    /// Execute test scenarios defined in YAML files
    Test {
        /// Paths to the YAML test scenario files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Verbose output
        #[arg(long, short)]
        verbose: bool,
    },
}
