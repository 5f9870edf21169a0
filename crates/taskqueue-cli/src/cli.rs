//! CLI argument parsing

use crate::commands::{self, ConfigArgs, RunArgs};
use crate::logging::{self, LogFormat};
use clap::{Parser, Subcommand};

/// taskqueue - prioritized background jobs under rate and concurrency limits
#[derive(Parser, Debug)]
#[command(name = "taskqueue")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit simulated jobs and drain them until every job settles
    Run(RunArgs),

    /// Print the effective dispatcher configuration
    Config(ConfigArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> anyhow::Result<()> {
        logging::init(self.log_format);
        match self.command {
            Commands::Run(args) => commands::run(args).await,
            Commands::Config(args) => commands::show_config(args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskqueue_jobs::JobPriority;

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["taskqueue", "run"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Pretty);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.jobs, 20);
                assert_eq!(args.priority, None);
                assert_eq!(args.success_rate, 0.5);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn run_flags() {
        let cli = Cli::try_parse_from([
            "taskqueue",
            "run",
            "--jobs",
            "5",
            "--priority",
            "HIGH",
            "--max-retries",
            "1",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.jobs, 5);
                assert_eq!(args.priority, Some(JobPriority::High));
                assert_eq!(args.max_retries, Some(1));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn unknown_priority_is_rejected() {
        assert!(Cli::try_parse_from(["taskqueue", "run", "--priority", "urgent"]).is_err());
    }

    #[test]
    fn success_rate_must_be_a_probability() {
        assert!(Cli::try_parse_from(["taskqueue", "run", "--success-rate", "1.5"]).is_err());
    }
}
