//! CarbonBOM CLI — product carbon-footprint decomposition tool.
//!
//! Decomposes a product into a tiered bill of materials and attributes
//! production and transport emissions to every component.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
