//! taskqueue: run a batch of simulated jobs through the dispatcher

mod cli;
mod commands;
mod logging;

use clap::Parser;
use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.execute().await
}
