//! kpa binary entry point.
//!
//! Parses arguments, sets up logging and dispatches to the subcommand. A
//! cancelled run exits with status 130 right away, without waiting for a
//! pending terminal read.

mod cli;
mod console;
mod logging;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, EXIT_CANCELLED};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Best effort, before tracing is initialized.
    logging::cleanup_old_logs(&cli.dir);

    let guard = logging::init_tracing(&cli.dir, cli.log_command(), cli.verbose())?;

    let status = cli.run().await?;
    if status == EXIT_CANCELLED {
        drop(guard);
        std::process::exit(i32::from(EXIT_CANCELLED));
    }
    Ok(ExitCode::from(status))
}
