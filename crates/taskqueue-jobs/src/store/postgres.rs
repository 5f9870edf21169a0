use super::{CreateJob, JobStore};
use crate::error::{JobError, Result};
use crate::job::{JobId, JobPriority, JobRecord, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

const COLUMNS: &str =
    "id, task_name, task_data, priority, status, retry_count, max_retries, created_at, next_retry_time";

/// Postgres-backed job store
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
    table_name: String,
}

impl PostgresStore {
    pub fn new(pool: Pool<Postgres>, table_name: &str) -> Self {
        Self {
            pool,
            table_name: table_name.to_string(),
        }
    }

    /// Initialize the database schema
    pub async fn ensure_schema(&self) -> Result<()> {
        let query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                task_name VARCHAR(255) NOT NULL,
                task_data TEXT NOT NULL,
                priority SMALLINT NOT NULL,
                status TEXT NOT NULL,
                retry_count INT NOT NULL DEFAULT 0,
                max_retries INT NOT NULL DEFAULT 3,
                created_at TIMESTAMPTZ NOT NULL,
                next_retry_time TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table} (status, priority, created_at);
            "#,
            table = self.table_name
        );

        sqlx::raw_sql(&query)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    async fn fetch_ordered(&self, query: &str, now: Option<DateTime<Utc>>) -> Result<Vec<JobRecord>> {
        let mut q = sqlx::query(query);
        if let Some(now) = now {
            q = q.bind(now);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(backend_error)?;
        rows.iter().map(record_from_row).collect()
    }
}

fn backend_error(err: sqlx::Error) -> JobError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            JobError::StoreUnavailable
        }
        other => JobError::Backend(other.to_string()),
    }
}

/// Counters live in INT columns.
fn to_column(value: u32, column: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| JobError::Validation(format!("{} {} exceeds {}", column, value, i32::MAX)))
}

fn from_column(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| JobError::Backend(format!("negative {} {} in store", column, value)))
}

fn record_from_row(row: &PgRow) -> Result<JobRecord> {
    let rank: i16 = row.try_get("priority").map_err(backend_error)?;
    let priority = u8::try_from(rank)
        .ok()
        .and_then(JobPriority::from_rank)
        .ok_or_else(|| JobError::Backend(format!("invalid priority rank {}", rank)))?;
    let status: String = row.try_get("status").map_err(backend_error)?;

    Ok(JobRecord {
        id: row.try_get("id").map_err(backend_error)?,
        task_name: row.try_get("task_name").map_err(backend_error)?,
        task_data: row.try_get("task_data").map_err(backend_error)?,
        priority,
        status: status.parse::<JobStatus>()?,
        retry_count: from_column(row.try_get("retry_count").map_err(backend_error)?, "retry_count")?,
        max_retries: from_column(row.try_get("max_retries").map_err(backend_error)?, "max_retries")?,
        created_at: row.try_get("created_at").map_err(backend_error)?,
        next_retry_time: row.try_get("next_retry_time").map_err(backend_error)?,
    })
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn create(&self, job: CreateJob) -> Result<JobRecord> {
        let record = JobRecord::pending(
            Uuid::new_v4(),
            job.task_name,
            job.task_data,
            job.priority,
            job.max_retries,
            Utc::now(),
        );

        let query = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table_name, COLUMNS
        );
        sqlx::query(&query)
            .bind(record.id)
            .bind(&record.task_name)
            .bind(&record.task_data)
            .bind(record.priority.rank() as i16)
            .bind(record.status.as_str())
            .bind(to_column(record.retry_count, "retry_count")?)
            .bind(to_column(record.max_retries, "max_retries")?)
            .bind(record.created_at)
            .bind(record.next_retry_time)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let query = format!("SELECT {} FROM {} WHERE id = $1", COLUMNS, self.table_name);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_error)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_all(&self) -> Result<Vec<JobRecord>> {
        let query = format!(
            "SELECT {} FROM {} ORDER BY created_at DESC",
            COLUMNS, self.table_name
        );
        self.fetch_ordered(&query, None).await
    }

    async fn list_pending(&self) -> Result<Vec<JobRecord>> {
        let query = format!(
            "SELECT {} FROM {} WHERE status = 'pending' ORDER BY priority ASC, created_at ASC",
            COLUMNS, self.table_name
        );
        self.fetch_ordered(&query, None).await
    }

    async fn list_retriable_failed(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let query = format!(
            r#"
            SELECT {} FROM {}
            WHERE status = 'failed'
              AND next_retry_time <= $1
              AND retry_count <= max_retries
            ORDER BY priority ASC, created_at ASC
            "#,
            COLUMNS, self.table_name
        );
        self.fetch_ordered(&query, Some(now)).await
    }

    async fn update(&self, job: &JobRecord) -> Result<()> {
        let query = format!(
            r#"
            UPDATE {}
            SET priority = $2, status = $3, retry_count = $4, max_retries = $5, next_retry_time = $6
            WHERE id = $1
            "#,
            self.table_name
        );
        let result = sqlx::query(&query)
            .bind(job.id)
            .bind(job.priority.rank() as i16)
            .bind(job.status.as_str())
            .bind(to_column(job.retry_count, "retry_count")?)
            .bind(to_column(job.max_retries, "max_retries")?)
            .bind(job.next_retry_time)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(job.id));
        }
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
