//! CLI commands

mod config;
mod run;

pub use config::{show_config, ConfigArgs};
pub use run::{run, RunArgs};
