//! Run command: submit simulated jobs and drain them

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use console::style;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use taskqueue_jobs::{
    DispatchConfig, Dispatcher, DrainReport, InMemoryStore, JobError, JobExecutor,
    JobPriority, JobRecord, JobService, JobStore, NewJob,
};

/// Arguments for the `run` command
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of jobs to submit
    #[arg(short = 'n', long, default_value = "20")]
    pub jobs: usize,

    /// Task name for every submitted job
    #[arg(long, default_value = "demo_task")]
    pub task_name: String,

    /// Opaque payload for every submitted job
    #[arg(long, default_value = "{}")]
    pub data: String,

    /// Priority for every job; random when omitted
    #[arg(short, long)]
    pub priority: Option<JobPriority>,

    /// Retry budget per job; the configured default when omitted
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Chance that a simulated attempt succeeds
    #[arg(long, default_value = "0.5", value_parser = parse_probability)]
    pub success_rate: f64,

    /// Simulated work per attempt, in milliseconds
    #[arg(long, default_value = "1000")]
    pub work_ms: u64,

    /// How often to sweep for due retries, in milliseconds
    #[arg(long, default_value = "500")]
    pub sweep_ms: u64,

    /// Persist jobs in Postgres instead of memory
    #[arg(long)]
    pub database_url: Option<String>,
}

fn parse_probability(s: &str) -> std::result::Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{} is outside 0.0..=1.0", value))
    }
}

/// Sleeps for a fixed time, then succeeds with a fixed probability.
struct SimulatedWork {
    success_rate: f64,
    work: Duration,
}

#[async_trait]
impl JobExecutor for SimulatedWork {
    async fn execute(&self, job: &JobRecord) -> taskqueue_jobs::Result<()> {
        let roll: f64 = rand::thread_rng().gen();
        tokio::time::sleep(self.work).await;
        if roll < self.success_rate {
            Ok(())
        } else {
            Err(JobError::Execution(format!(
                "simulated failure on attempt {}",
                job.retry_count + 1
            )))
        }
    }
}

pub async fn run(args: RunArgs) -> Result<()> {
    let config = DispatchConfig::from_env().context("invalid TASKQUEUE_* configuration")?;
    let store = open_store(args.database_url.as_deref()).await?;
    let executor = SimulatedWork {
        success_rate: args.success_rate,
        work: Duration::from_millis(args.work_ms),
    };
    let service = JobService::new(Dispatcher::from_shared(store, Arc::new(executor), &config)?);

    println!(
        "{} {} jobs, at most {} running and {} started per {:?}",
        style("Submitting").bold(),
        args.jobs,
        config.max_concurrent_jobs,
        config.max_jobs_per_window,
        config.window_duration()
    );

    service.submit_batch(submissions(&args)).await?;

    let mut totals = service.dispatcher().process_pending().await?;
    let sweep = Duration::from_millis(args.sweep_ms.max(1));
    loop {
        let stats = service.stats().await?;
        if stats.unsettled() == 0 {
            break;
        }
        tokio::time::sleep(sweep).await;
        totals.absorb(service.dispatcher().process_failed().await?);
    }

    print_summary(&service, &totals).await
}

fn submissions(args: &RunArgs) -> Vec<NewJob> {
    let mut rng = rand::thread_rng();
    (0..args.jobs)
        .map(|_| {
            let priority = args
                .priority
                .or_else(|| JobPriority::ALL.choose(&mut rng).copied())
                .unwrap_or_default();
            let job = NewJob::new(args.task_name.clone(), args.data.clone()).priority(priority);
            match args.max_retries {
                Some(n) => job.max_retries(n),
                None => job,
            }
        })
        .collect()
}

async fn print_summary(service: &JobService, totals: &DrainReport) -> Result<()> {
    let stats = service.stats().await?;

    println!();
    println!("{}", style("All jobs settled").green().bold());
    println!(
        "  {} completed, {} dead-lettered, {} retries, {} rate-limit waits",
        style(stats.completed_jobs).green(),
        style(stats.dead_letter_jobs).red(),
        totals.retried,
        totals.rate_limited
    );
    if totals.settle_errors > 0 {
        println!(
            "  {}",
            style(format!(
                "{} outcomes could not be persisted, {} written later",
                totals.settle_errors, totals.recovered
            ))
            .yellow()
        );
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn open_store(database_url: Option<&str>) -> Result<Arc<dyn JobStore>> {
    match database_url {
        None => Ok(Arc::new(InMemoryStore::new())),
        Some(url) => connect_postgres(url).await,
    }
}

#[cfg(feature = "postgres")]
async fn connect_postgres(url: &str) -> Result<Arc<dyn JobStore>> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .context("could not connect to Postgres")?;
    let store = taskqueue_jobs::PostgresStore::new(pool, "taskqueue_jobs");
    store.ensure_schema().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_url: &str) -> Result<Arc<dyn JobStore>> {
    anyhow::bail!("--database-url needs the `postgres` feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskqueue_jobs::CreateJob;

    fn args(priority: Option<JobPriority>, max_retries: Option<u32>) -> RunArgs {
        RunArgs {
            jobs: 6,
            task_name: "demo".to_string(),
            data: "{}".to_string(),
            priority,
            max_retries,
            success_rate: 1.0,
            work_ms: 0,
            sweep_ms: 10,
            database_url: None,
        }
    }

    #[test]
    fn fixed_priority_applies_to_every_job() {
        let jobs = submissions(&args(Some(JobPriority::Low), Some(2)));
        assert_eq!(jobs.len(), 6);
        assert!(jobs.iter().all(|j| j.priority == Some(JobPriority::Low)));
        assert!(jobs.iter().all(|j| j.max_retries == Some(2)));
    }

    #[test]
    fn omitted_retry_budget_is_left_to_config() {
        let jobs = submissions(&args(None, None));
        assert!(jobs.iter().all(|j| j.priority.is_some()));
        assert!(jobs.iter().all(|j| j.max_retries.is_none()));
    }

    #[test]
    fn probability_bounds() {
        assert_eq!(parse_probability("0.25"), Ok(0.25));
        assert!(parse_probability("-0.1").is_err());
        assert!(parse_probability("often").is_err());
    }

    #[tokio::test]
    async fn simulated_work_honours_success_rate() {
        let request = CreateJob::from_new(NewJob::new("demo", "{}"), JobPriority::Medium, 3);
        let job = InMemoryStore::new().create(request).await.unwrap();
        let always = SimulatedWork {
            success_rate: 1.0,
            work: Duration::ZERO,
        };
        let never = SimulatedWork {
            success_rate: 0.0,
            work: Duration::ZERO,
        };
        assert!(always.execute(&job).await.is_ok());
        assert!(matches!(
            never.execute(&job).await,
            Err(JobError::Execution(_))
        ));
    }
}
