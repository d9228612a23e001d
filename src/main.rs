//! Binary entry point for the drift-inference pipeline.

use anyhow::Result;
use clap::Parser;

use antigenic_drift::cli::{run_cli, Cli};

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run_cli(cli)
}
