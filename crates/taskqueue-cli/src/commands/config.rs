//! Show the configuration a `run` would use

use anyhow::Result;
use clap::Args;
use console::style;
use taskqueue_jobs::{DispatchConfig, Environment};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print JSON only
    #[arg(long)]
    pub json: bool,
}

pub fn show_config(args: ConfigArgs) -> Result<()> {
    let config = DispatchConfig::from_env()?;
    let rendered = serde_json::to_string_pretty(&config)?;

    if args.json {
        println!("{}", rendered);
        return Ok(());
    }

    let env = Environment::current();
    println!(
        "{} {}",
        style("Environment:").bold(),
        style(&env).cyan()
    );
    println!("{}", style("Dispatcher configuration:").bold());
    println!("{}", rendered);
    Ok(())
}
