mod cli;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

fn main() -> Result<()> {
    env_logger::init();

    leadlens::output::print_banner();

    let cli = Cli::parse();
    info!("Starting LeadLens - lead-time pipeline compiler");
    cli.execute()?;

    Ok(())
}
