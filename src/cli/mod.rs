//! CLI module for treeserve
//!
//! Provides command-line interface for:
//! - serve: Serve HTTP from the configured git reference
//! - check: Compile one snapshot's handlers and report diagnostics

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{
    build_dispatcher, check, check_snapshot, resolver, run, run_command, serve, CheckReport,
    HandlerSummary,
};
pub use errors::{CliError, CliErrorCode, CliResult};
