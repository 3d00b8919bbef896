//! CLI argument definitions using clap
//!
//! Commands:
//! - treeserve serve --config <path> [--port <port>]
//! - treeserve check --config <path> [--reference <ref>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// treeserve - serve HTTP straight from a git reference
#[derive(Parser, Debug)]
#[command(name = "treeserve")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the HTTP server
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./treeserve.json")]
        config: PathBuf,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Compile the handlers of one snapshot and report diagnostics
    Check {
        /// Path to configuration file
        #[arg(long, default_value = "./treeserve.json")]
        config: PathBuf,

        /// Check this reference instead of the configured one
        #[arg(long)]
        reference: Option<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
