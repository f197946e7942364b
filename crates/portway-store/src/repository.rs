//! PostgreSQL job repository.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use crate::error::StoreError;
use crate::job::{JobStatus, StagedJob};

/// Repository configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Maximum open connections in the pool.
    pub max_connections: u32,
    /// Connections the pool keeps warm when idle.
    pub min_connections: u32,
    /// Maximum lifetime of a pooled connection.
    pub conn_max_lifetime: Duration,
    /// Staging table name.
    pub table_name: String,
    /// Response audit table name.
    pub response_table: String,
    /// Retry ceiling for claim eligibility; rows at or above it are poison
    /// rows left for operator inspection.
    pub max_job_retries: i32,
}

/// Job repository over a PostgreSQL pool.
///
/// All claim arbitration happens in the database: `claim_pending` locks the
/// selected rows with `FOR UPDATE SKIP LOCKED` and hands the open transaction
/// back to the caller, which resolves it once dispatch is decided.
#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
    table: String,
    response_table: String,
    max_job_retries: i32,
}

impl JobRepository {
    /// Connect to PostgreSQL and create the repository.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.conn_max_lifetime)
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self::from_pool(pool, config))
    }

    /// Create a repository from an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool, config: &StoreConfig) -> Self {
        Self {
            pool,
            table: config.table_name.clone(),
            response_table: config.response_table.clone(),
            max_job_retries: config.max_job_retries,
        }
    }

    /// Create the staging and response tables and their indexes if absent.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let create_staging = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                client_port INT NOT NULL,
                binary_data BYTEA NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                retry_count INT NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
            self.table
        );
        sqlx::query(&create_staging).execute(&self.pool).await?;

        // Claim predicate scans by status; ordering scans by created_at.
        let status_index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_status ON {0} (status)",
            self.table
        );
        sqlx::query(&status_index).execute(&self.pool).await?;

        let created_index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_created_at ON {0} (created_at)",
            self.table
        );
        sqlx::query(&created_index).execute(&self.pool).await?;

        let create_responses = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                request_id BIGINT NOT NULL,
                status_code INT NOT NULL,
                response_body BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.response_table
        );
        sqlx::query(&create_responses).execute(&self.pool).await?;

        let request_index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_request_id ON {0} (request_id)",
            self.response_table
        );
        sqlx::query(&request_index).execute(&self.pool).await?;

        Ok(())
    }

    /// Atomically claim up to `limit` eligible rows.
    ///
    /// The returned batch owns the transaction holding the row locks. The
    /// caller must resolve it with [`ClaimedBatch::commit_dispatched`] or
    /// [`ClaimedBatch::rollback`]; dropping the batch rolls back implicitly
    /// and the rows become claimable again.
    pub async fn claim_pending(&self, limit: i64) -> Result<ClaimedBatch, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            r#"
            SELECT id, client_port, binary_data, status, created_at, updated_at,
                   retry_count, last_error
            FROM {}
            WHERE status = $1 AND retry_count < $2
            ORDER BY created_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
            self.table
        );

        let rows = sqlx::query(&query)
            .bind(JobStatus::Pending.as_str())
            .bind(self.max_job_retries)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        let jobs = rows
            .iter()
            .map(row_to_job)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count = jobs.len(), "claimed pending jobs");

        Ok(ClaimedBatch {
            jobs,
            tx,
            table: self.table.clone(),
        })
    }

    /// Update a job's status and error text.
    pub async fn mark(
        &self,
        id: i64,
        status: JobStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let query = format!(
            "UPDATE {} SET status = $1, updated_at = NOW(), last_error = $2 WHERE id = $3",
            self.table
        );

        sqlx::query(&query)
            .bind(status.as_str())
            .bind(last_error)
            .bind(id)
            .execute(&self.pool)
            .await?;

        debug!(id, status = %status, "updated job status");
        Ok(())
    }

    /// Increment a job's retry count.
    pub async fn increment_retry(&self, id: i64) -> Result<(), StoreError> {
        let query = format!(
            "UPDATE {} SET retry_count = retry_count + 1, updated_at = NOW() WHERE id = $1",
            self.table
        );

        sqlx::query(&query).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Record an upstream reply for audit. Returns the record id.
    pub async fn insert_response(
        &self,
        request_id: i64,
        status_code: i32,
        body: &[u8],
    ) -> Result<i64, StoreError> {
        let query = format!(
            r#"
            INSERT INTO {} (request_id, status_code, response_body, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id
            "#,
            self.response_table
        );

        let row = sqlx::query(&query)
            .bind(request_id)
            .bind(status_code)
            .bind(body)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("id"))
    }

    /// Delete a processed job row. Errors when the row is absent.
    pub async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let query = format!("DELETE FROM {} WHERE id = $1", self.table);

        let result = sqlx::query(&query).bind(id).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound(id));
        }

        debug!(id, "deleted processed job");
        Ok(())
    }

    /// Stage a new pending job. Returns its id.
    pub async fn insert_job(&self, client_port: u16, binary: &[u8]) -> Result<i64, StoreError> {
        let query = format!(
            r#"
            INSERT INTO {} (client_port, binary_data, status, created_at, updated_at, retry_count)
            VALUES ($1, $2, $3, NOW(), NOW(), 0)
            RETURNING id
            "#,
            self.table
        );

        let row = sqlx::query(&query)
            .bind(i32::from(client_port))
            .bind(binary)
            .bind(JobStatus::Pending.as_str())
            .fetch_one(&self.pool)
            .await?;

        let id: i64 = row.get("id");
        debug!(id, client_port, "staged new job");
        Ok(id)
    }

    /// Count rows currently pending.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let query = format!("SELECT COUNT(*) AS n FROM {} WHERE status = $1", self.table);

        let row = sqlx::query(&query)
            .bind(JobStatus::Pending.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("n"))
    }

    /// Return `failed` rows under the retry ceiling to `pending` so the next
    /// claim picks them up. Poison rows at the ceiling stay `failed` for
    /// operator inspection.
    pub async fn requeue_failed(&self) -> Result<u64, StoreError> {
        let query = format!(
            r#"
            UPDATE {} SET status = $1, updated_at = NOW()
            WHERE status = $2 AND retry_count < $3
            "#,
            self.table
        );

        let result = sqlx::query(&query)
            .bind(JobStatus::Pending.as_str())
            .bind(JobStatus::Failed.as_str())
            .bind(self.max_job_retries)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Demote `sending` rows whose last transition is older than `grace`
    /// back to `pending`. Covers rows orphaned by a crashed process; a live
    /// worker refreshes `updated_at` when it re-marks the row at pipeline
    /// entry.
    pub async fn release_stale_sending(&self, grace: Duration) -> Result<u64, StoreError> {
        let query = format!(
            r#"
            UPDATE {} SET status = $1, updated_at = NOW()
            WHERE status = $2 AND updated_at < NOW() - ($3 * INTERVAL '1 second')
            "#,
            self.table
        );

        let result = sqlx::query(&query)
            .bind(JobStatus::Pending.as_str())
            .bind(JobStatus::Sending.as_str())
            .bind(grace.as_secs_f64())
            .execute(&self.pool)
            .await?;

        let released = result.rows_affected();
        if released > 0 {
            debug!(released, "released stale sending rows");
        }
        Ok(released)
    }
}

impl std::fmt::Debug for JobRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRepository")
            .field("table", &self.table)
            .field("response_table", &self.response_table)
            .field("max_job_retries", &self.max_job_retries)
            .finish_non_exhaustive()
    }
}

/// A batch of claimed jobs together with the transaction holding their locks.
pub struct ClaimedBatch {
    /// The claimed jobs, oldest first.
    pub jobs: Vec<StagedJob>,
    tx: Transaction<'static, Postgres>,
    table: String,
}

impl ClaimedBatch {
    /// Mark exactly the dispatched ids `sending` and commit.
    ///
    /// The mark happens inside the claim transaction, so the
    /// `pending → sending` transition occurs under the row lock and the rows
    /// are invisible to other claimants from the moment the locks release.
    /// Claimed rows not named in `ids` are untouched and return to
    /// eligibility at commit.
    pub async fn commit_dispatched(mut self, ids: &[i64]) -> Result<(), StoreError> {
        if !ids.is_empty() {
            let query = format!(
                "UPDATE {} SET status = $1, updated_at = NOW() WHERE id = ANY($2)",
                self.table
            );
            sqlx::query(&query)
                .bind(JobStatus::Sending.as_str())
                .bind(ids)
                .execute(&mut *self.tx)
                .await?;
        }

        self.tx.commit().await?;
        Ok(())
    }

    /// Release all claimed rows unchanged.
    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl std::fmt::Debug for ClaimedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedBatch")
            .field("jobs", &self.jobs.len())
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

fn row_to_job(row: &PgRow) -> Result<StagedJob, StoreError> {
    let id: i64 = row.get("id");
    let client_port: i32 = row.get("client_port");
    let binary_data: Vec<u8> = row.get("binary_data");
    let status_str: String = row.get("status");
    let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
    let updated_at: chrono::DateTime<chrono::Utc> = row.get("updated_at");
    let retry_count: i32 = row.get("retry_count");
    let last_error: Option<String> = row.get("last_error");

    let client_port = u16::try_from(client_port)
        .map_err(|_| StoreError::InvalidPort(i64::from(client_port)))?;
    let status = JobStatus::parse(&status_str)?;

    Ok(StagedJob {
        id,
        client_port,
        binary_data,
        status,
        created_at,
        updated_at,
        retry_count,
        last_error,
    })
}
