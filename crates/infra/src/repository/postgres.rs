//! Postgres-backed execution repository.
//!
//! Persists job instances, executions and execution contexts in the schema of
//! `migrations/0001_batch_schema.sql`. Optimistic locking is enforced by the
//! database: every update is `UPDATE … SET version = version + 1 WHERE id = $n
//! AND version = $m`, and zero affected rows means another writer got there
//! first.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `InstanceAlreadyExists` / `Concurrency` | Duplicate instance identity, concurrent insert |
//! | Database (foreign key violation) | `23503` | `NotFound` | Step saved for an unknown job execution |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! ## Sync bridge
//!
//! The engine drives steps on plain threads, so [`JobRepository`] is
//! synchronous. The adapter keeps a handle to the tokio runtime that owns the
//! pool and blocks on it; it must therefore be called from threads that are
//! not themselves running async tasks.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use batchforge_core::{
    BatchStatus, ExecutionContext, ExitStatus, JobExecution, JobExecutionId, JobInstance,
    JobInstanceId, JobParameters, StepCounters, StepExecution, StepExecutionId,
};

use super::explorer::{ExecutionSummary, JobExplorer, Pagination};
use super::r#trait::{JobRepository, RepositoryError, check_restartable};

const SCHEMA: &str = include_str!("../../migrations/0001_batch_schema.sql");

const JOB_EXECUTION_COLUMNS: &str = r#"
    e.id, e.status, e.exit_code, e.exit_message, e.job_parameters,
    e.create_time, e.start_time, e.end_time, e.last_updated, e.version,
    i.id AS instance_id, i.job_name, i.job_key, i.version AS instance_version,
    c.serialized_context
    FROM batch_job_execution e
    JOIN batch_job_instance i ON i.id = e.job_instance_id
    LEFT JOIN batch_execution_context c ON c.owner_id = e.id AND c.owner_type = 'JOB'
"#;

const STEP_EXECUTION_COLUMNS: &str = r#"
    s.id, s.job_execution_id, s.job_instance_id, s.step_name, s.status,
    s.exit_code, s.exit_message, s.read_count, s.write_count, s.filter_count,
    s.read_skip_count, s.process_skip_count, s.write_skip_count, s.commit_count,
    s.rollback_count, s.failures, s.create_time, s.start_time, s.end_time,
    s.last_updated, s.version, c.serialized_context
    FROM batch_step_execution s
    LEFT JOIN batch_execution_context c ON c.owner_id = s.id AND c.owner_type = 'STEP'
"#;

/// Postgres-backed execution repository.
///
/// ## Thread Safety
///
/// Uses the SQLx connection pool, which is `Send + Sync`. Multi-row writes
/// (execution + context, chunk checkpoints) run in one database transaction.
#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobRepository {
    /// Wrap an existing pool. `runtime` must be the runtime that drives it.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect a new pool on the current runtime.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    /// Create the schema if it does not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    #[instrument(skip(self, parameters), fields(job_name = %job_name), err)]
    pub async fn insert_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance, RepositoryError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        insert_instance(&mut conn, job_name, &parameters.job_key()).await
    }

    #[instrument(skip(self, parameters), fields(job_name = %job_name), err)]
    pub async fn fetch_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        find_instance(&mut conn, job_name, &parameters.job_key()).await
    }

    /// Create (or restart) an execution of the instance identified by
    /// `(job_name, parameters)` in one transaction.
    #[instrument(skip(self, parameters), fields(job_name = %job_name, job_execution_id = tracing::field::Empty), err)]
    pub async fn start_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let job_key = parameters.job_key();
        let (instance, context) = match find_instance(&mut tx, job_name, &job_key).await? {
            Some(instance) => {
                let executions = job_executions_of(&mut tx, instance.id).await?;
                let last = check_restartable(&instance, parameters, &executions)?;
                let context = last.execution_context.clone();
                (instance, context)
            }
            None => (
                insert_instance(&mut tx, job_name, &job_key).await?,
                ExecutionContext::new(),
            ),
        };

        let mut execution = JobExecution::new(instance, parameters.clone());
        execution.execution_context = context;
        insert_job_execution(&mut tx, &mut execution).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if let Some(id) = execution.id {
            Span::current().record("job_execution_id", id.get());
        }
        Ok(execution)
    }

    #[instrument(skip(self, execution), err)]
    pub async fn insert_job_execution(
        &self,
        execution: &mut JobExecution,
    ) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        insert_job_execution(&mut tx, execution).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, execution), fields(job_execution_id = ?execution.id, version = ?execution.version), err)]
    pub async fn write_job_execution(
        &self,
        execution: &mut JobExecution,
    ) -> Result<(), RepositoryError> {
        let id = execution.id.ok_or_else(|| {
            RepositoryError::InvalidArgument("job execution has not been saved".to_string())
        })?;
        let expected = execution.version.ok_or_else(|| {
            RepositoryError::InvalidArgument("job execution has no version".to_string())
        })?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE batch_job_execution
            SET status = $1,
                exit_code = $2,
                exit_message = $3,
                start_time = $4,
                end_time = $5,
                last_updated = $6,
                version = version + 1
            WHERE id = $7 AND version = $8
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.exit_status.code())
        .bind(execution.exit_status.description())
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(now)
        .bind(id.get())
        .bind(expected as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job_execution", e))?;

        if result.rows_affected() == 0 {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| map_sqlx_error("acquire", e))?;
            let actual = current_version(&mut conn, "batch_job_execution", id.get()).await?;
            return Err(match actual {
                Some(actual) => RepositoryError::Concurrency(format!(
                    "job execution {id}: expected version {expected}, found {actual}"
                )),
                None => RepositoryError::NotFound(format!("job execution {id}")),
            });
        }

        execution.version = Some(expected + 1);
        execution.last_updated = Some(now);
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_EXECUTION_COLUMNS} WHERE e.id = $1"))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job_execution", e))?;
        row.map(|r| job_execution_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        job_executions_of(&mut conn, instance_id).await
    }

    #[instrument(skip(self, step), fields(step_name = %step.step_name), err)]
    pub async fn insert_step_execution(
        &self,
        step: &mut StepExecution,
    ) -> Result<(), RepositoryError> {
        if step.id.is_some() || step.version.is_some() {
            return Err(RepositoryError::InvalidArgument(
                "step execution already has an identity or version".to_string(),
            ));
        }
        let context = step.execution_context.to_json()?;
        let failures = serde_json::to_value(&step.failures)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let counters = step.counters;
        let row = sqlx::query(
            r#"
            INSERT INTO batch_step_execution (
                job_execution_id, job_instance_id, step_name, status, exit_code,
                exit_message, read_count, write_count, filter_count, read_skip_count,
                process_skip_count, write_skip_count, commit_count, rollback_count,
                failures, create_time, start_time, end_time, last_updated, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, 0)
            RETURNING id
            "#,
        )
        .bind(step.job_execution_id.get())
        .bind(step.job_instance_id.get())
        .bind(&step.step_name)
        .bind(step.status.as_str())
        .bind(step.exit_status.code())
        .bind(step.exit_status.description())
        .bind(counters.read_count as i64)
        .bind(counters.write_count as i64)
        .bind(counters.filter_count as i64)
        .bind(counters.read_skip_count as i64)
        .bind(counters.process_skip_count as i64)
        .bind(counters.write_skip_count as i64)
        .bind(counters.commit_count as i64)
        .bind(counters.rollback_count as i64)
        .bind(failures)
        .bind(step.create_time)
        .bind(step.start_time)
        .bind(step.end_time)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_step_execution", e))?;
        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("insert_step_execution", e))?;

        upsert_context(&mut tx, id, OwnerType::Step, &context).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        step.id = Some(StepExecutionId::new(id));
        step.version = Some(0);
        step.last_updated = Some(now);
        Ok(())
    }

    /// Versioned update of a step row, optionally together with its context.
    #[instrument(
        skip(self, step),
        fields(step_execution_id = ?step.id, version = ?step.version),
        err
    )]
    pub async fn write_step_execution(
        &self,
        step: &mut StepExecution,
        with_context: bool,
    ) -> Result<(), RepositoryError> {
        let id = step.id.ok_or_else(|| {
            RepositoryError::InvalidArgument("step execution has not been saved".to_string())
        })?;
        let expected = step.version.ok_or_else(|| {
            RepositoryError::InvalidArgument("step execution has no version".to_string())
        })?;
        let context = if with_context {
            Some(step.execution_context.to_json()?)
        } else {
            None
        };
        let failures = serde_json::to_value(&step.failures)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let now = Utc::now();
        let counters = step.counters;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE batch_step_execution
            SET status = $1,
                exit_code = $2,
                exit_message = $3,
                read_count = $4,
                write_count = $5,
                filter_count = $6,
                read_skip_count = $7,
                process_skip_count = $8,
                write_skip_count = $9,
                commit_count = $10,
                rollback_count = $11,
                failures = $12,
                start_time = $13,
                end_time = $14,
                last_updated = $15,
                version = version + 1
            WHERE id = $16 AND version = $17
            "#,
        )
        .bind(step.status.as_str())
        .bind(step.exit_status.code())
        .bind(step.exit_status.description())
        .bind(counters.read_count as i64)
        .bind(counters.write_count as i64)
        .bind(counters.filter_count as i64)
        .bind(counters.read_skip_count as i64)
        .bind(counters.process_skip_count as i64)
        .bind(counters.write_skip_count as i64)
        .bind(counters.commit_count as i64)
        .bind(counters.rollback_count as i64)
        .bind(failures)
        .bind(step.start_time)
        .bind(step.end_time)
        .bind(now)
        .bind(id.get())
        .bind(expected as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_step_execution", e))?;

        if result.rows_affected() == 0 {
            let actual = current_version(&mut tx, "batch_step_execution", id.get()).await?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(match actual {
                Some(actual) => RepositoryError::Concurrency(format!(
                    "step execution {id}: expected version {expected}, found {actual}"
                )),
                None => RepositoryError::NotFound(format!("step execution {id}")),
            });
        }

        if let Some(context) = &context {
            upsert_context(&mut tx, id.get(), OwnerType::Step, context).await?;
        }

        let job_status: Option<String> =
            sqlx::query_scalar("SELECT status FROM batch_job_execution WHERE id = $1")
                .bind(step.job_execution_id.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("check_for_interruption", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        step.version = Some(expected + 1);
        step.last_updated = Some(now);
        if job_status.as_deref() == Some(BatchStatus::Stopping.as_str()) {
            step.set_terminate_only();
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_step_execution(
        &self,
        id: StepExecutionId,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {STEP_EXECUTION_COLUMNS} WHERE s.id = $1"))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_step_execution", e))?;
        row.map(|r| step_execution_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} WHERE s.job_execution_id = $1 ORDER BY s.id ASC"
        ))
        .bind(job_execution_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_step_executions", e))?;
        rows.iter().map(step_execution_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} \
             WHERE s.job_instance_id = $1 AND s.step_name = $2 \
             ORDER BY COALESCE(s.start_time, s.create_time) DESC, s.id DESC \
             LIMIT 1"
        ))
        .bind(instance_id.get())
        .bind(step_name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_last_step_execution", e))?;
        row.map(|r| step_execution_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn count_step_executions(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<usize, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM batch_step_execution WHERE job_instance_id = $1 AND step_name = $2",
        )
        .bind(instance_id.get())
        .bind(step_name)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("step_execution_count", e))?;
        Ok(count as usize)
    }

    async fn write_context(
        &self,
        owner_id: i64,
        owner_type: OwnerType,
        context: &ExecutionContext,
    ) -> Result<(), RepositoryError> {
        let json = context.to_json()?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        upsert_context(&mut conn, owner_id, owner_type, &json).await
    }
}

#[derive(Debug, Clone, Copy)]
enum OwnerType {
    Job,
    Step,
}

impl OwnerType {
    fn as_str(self) -> &'static str {
        match self {
            OwnerType::Job => "JOB",
            OwnerType::Step => "STEP",
        }
    }
}

async fn insert_instance(
    conn: &mut PgConnection,
    job_name: &str,
    job_key: &str,
) -> Result<JobInstance, RepositoryError> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO batch_job_instance (job_name, job_key, version) VALUES ($1, $2, 0) RETURNING id",
    )
    .bind(job_name)
    .bind(job_key)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            RepositoryError::InstanceAlreadyExists(format!("job '{job_name}' with key {job_key}"))
        } else {
            map_sqlx_error("create_job_instance", e)
        }
    })?;

    Ok(JobInstance {
        id: JobInstanceId::new(id),
        job_name: job_name.to_string(),
        job_key: job_key.to_string(),
        version: 0,
    })
}

async fn find_instance(
    conn: &mut PgConnection,
    job_name: &str,
    job_key: &str,
) -> Result<Option<JobInstance>, RepositoryError> {
    let row = sqlx::query(
        "SELECT id, job_name, job_key, version FROM batch_job_instance WHERE job_name = $1 AND job_key = $2",
    )
    .bind(job_name)
    .bind(job_key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("get_job_instance", e))?;
    row.map(|r| instance_from_row(&r)).transpose()
}

async fn job_executions_of(
    conn: &mut PgConnection,
    instance_id: JobInstanceId,
) -> Result<Vec<JobExecution>, RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_EXECUTION_COLUMNS} WHERE e.job_instance_id = $1 ORDER BY e.id DESC"
    ))
    .bind(instance_id.get())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_job_executions", e))?;
    rows.iter().map(job_execution_from_row).collect()
}

async fn insert_job_execution(
    conn: &mut PgConnection,
    execution: &mut JobExecution,
) -> Result<(), RepositoryError> {
    if execution.id.is_some() || execution.version.is_some() {
        return Err(RepositoryError::InvalidArgument(
            "job execution already has an identity or version".to_string(),
        ));
    }
    let context = execution.execution_context.to_json()?;
    let parameters = serde_json::to_value(&execution.job_parameters)
        .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
    let now = Utc::now();

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO batch_job_execution (
            job_instance_id, status, exit_code, exit_message, job_parameters,
            create_time, start_time, end_time, last_updated, version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0)
        RETURNING id
        "#,
    )
    .bind(execution.job_instance.id.get())
    .bind(execution.status.as_str())
    .bind(execution.exit_status.code())
    .bind(execution.exit_status.description())
    .bind(parameters)
    .bind(execution.create_time)
    .bind(execution.start_time)
    .bind(execution.end_time)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job_execution", e))?;

    upsert_context(conn, id, OwnerType::Job, &context).await?;

    execution.id = Some(JobExecutionId::new(id));
    execution.version = Some(0);
    execution.last_updated = Some(now);
    Ok(())
}

async fn upsert_context(
    conn: &mut PgConnection,
    owner_id: i64,
    owner_type: OwnerType,
    serialized: &str,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        INSERT INTO batch_execution_context (owner_id, owner_type, serialized_context)
        VALUES ($1, $2, $3)
        ON CONFLICT (owner_id, owner_type)
        DO UPDATE SET serialized_context = EXCLUDED.serialized_context
        "#,
    )
    .bind(owner_id)
    .bind(owner_type.as_str())
    .bind(serialized)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_execution_context", e))?;
    Ok(())
}

async fn current_version(
    conn: &mut PgConnection,
    table: &'static str,
    id: i64,
) -> Result<Option<i64>, RepositoryError> {
    sqlx::query_scalar(&format!("SELECT version FROM {table} WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("current_version", e))
}

fn instance_from_row(row: &PgRow) -> Result<JobInstance, RepositoryError> {
    let map = |e| map_sqlx_error("read_job_instance", e);
    Ok(JobInstance {
        id: JobInstanceId::new(row.try_get("id").map_err(map)?),
        job_name: row.try_get("job_name").map_err(map)?,
        job_key: row.try_get("job_key").map_err(map)?,
        version: row.try_get::<i64, _>("version").map_err(map)? as u64,
    })
}

fn job_execution_from_row(row: &PgRow) -> Result<JobExecution, RepositoryError> {
    let map = |e| map_sqlx_error("read_job_execution", e);
    let status: String = row.try_get("status").map_err(map)?;
    let exit_code: String = row.try_get("exit_code").map_err(map)?;
    let exit_message: String = row.try_get("exit_message").map_err(map)?;
    let parameters: serde_json::Value = row.try_get("job_parameters").map_err(map)?;
    let context: Option<String> = row.try_get("serialized_context").map_err(map)?;

    Ok(JobExecution {
        id: Some(JobExecutionId::new(row.try_get("id").map_err(map)?)),
        version: Some(row.try_get::<i64, _>("version").map_err(map)? as u64),
        job_instance: JobInstance {
            id: JobInstanceId::new(row.try_get("instance_id").map_err(map)?),
            job_name: row.try_get("job_name").map_err(map)?,
            job_key: row.try_get("job_key").map_err(map)?,
            version: row.try_get::<i64, _>("instance_version").map_err(map)? as u64,
        },
        job_parameters: serde_json::from_value(parameters)
            .map_err(|e| RepositoryError::Serialization(format!("job parameters: {e}")))?,
        status: parse_status(&status)?,
        exit_status: ExitStatus::new(exit_code).with_description(exit_message),
        create_time: row.try_get("create_time").map_err(map)?,
        start_time: row.try_get::<Option<DateTime<Utc>>, _>("start_time").map_err(map)?,
        end_time: row.try_get::<Option<DateTime<Utc>>, _>("end_time").map_err(map)?,
        last_updated: row.try_get::<Option<DateTime<Utc>>, _>("last_updated").map_err(map)?,
        execution_context: parse_context(context.as_deref())?,
    })
}

fn step_execution_from_row(row: &PgRow) -> Result<StepExecution, RepositoryError> {
    let map = |e| map_sqlx_error("read_step_execution", e);
    let count = |name: &str| -> Result<u64, RepositoryError> {
        Ok(row
            .try_get::<i64, _>(name)
            .map_err(|e| map_sqlx_error("read_step_execution", e))? as u64)
    };
    let status: String = row.try_get("status").map_err(map)?;
    let exit_code: String = row.try_get("exit_code").map_err(map)?;
    let exit_message: String = row.try_get("exit_message").map_err(map)?;
    let failures: serde_json::Value = row.try_get("failures").map_err(map)?;
    let context: Option<String> = row.try_get("serialized_context").map_err(map)?;

    Ok(StepExecution {
        id: Some(StepExecutionId::new(row.try_get("id").map_err(map)?)),
        version: Some(count("version")?),
        job_execution_id: JobExecutionId::new(row.try_get("job_execution_id").map_err(map)?),
        job_instance_id: JobInstanceId::new(row.try_get("job_instance_id").map_err(map)?),
        step_name: row.try_get("step_name").map_err(map)?,
        status: parse_status(&status)?,
        exit_status: ExitStatus::new(exit_code).with_description(exit_message),
        counters: StepCounters {
            read_count: count("read_count")?,
            write_count: count("write_count")?,
            filter_count: count("filter_count")?,
            read_skip_count: count("read_skip_count")?,
            process_skip_count: count("process_skip_count")?,
            write_skip_count: count("write_skip_count")?,
            commit_count: count("commit_count")?,
            rollback_count: count("rollback_count")?,
        },
        create_time: row.try_get("create_time").map_err(map)?,
        start_time: row.try_get::<Option<DateTime<Utc>>, _>("start_time").map_err(map)?,
        end_time: row.try_get::<Option<DateTime<Utc>>, _>("end_time").map_err(map)?,
        last_updated: row.try_get::<Option<DateTime<Utc>>, _>("last_updated").map_err(map)?,
        execution_context: parse_context(context.as_deref())?,
        failures: serde_json::from_value(failures)
            .map_err(|e| RepositoryError::Serialization(format!("step failures: {e}")))?,
        terminate_only: false,
    })
}

fn parse_status(status: &str) -> Result<BatchStatus, RepositoryError> {
    BatchStatus::from_str(status).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

fn parse_context(serialized: Option<&str>) -> Result<ExecutionContext, RepositoryError> {
    match serialized {
        Some(json) => Ok(ExecutionContext::from_json(json)?),
        None => Ok(ExecutionContext::new()),
    }
}

/// Map SQLx errors to RepositoryError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => RepositoryError::Concurrency(msg),
                Some("23503") => RepositoryError::NotFound(msg),
                _ => RepositoryError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            RepositoryError::NotFound(format!("unexpected row not found in {}", operation))
        }
        _ => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

impl JobRepository for PostgresJobRepository {
    fn create_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance, RepositoryError> {
        self.block_on(self.insert_job_instance(job_name, parameters))
    }

    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        self.block_on(self.fetch_job_instance(job_name, parameters))
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, RepositoryError> {
        self.block_on(self.start_job_execution(job_name, parameters))
    }

    fn save_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        self.block_on(self.insert_job_execution(execution))
    }

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        self.block_on(self.write_job_execution(execution))
    }

    fn synchronize_status(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        let Some(id) = execution.id else {
            return Ok(());
        };
        if let Some(stored) = self.block_on(self.fetch_job_execution(id))? {
            if stored.version != execution.version {
                execution.upgrade_status(stored.status);
                execution.version = stored.version;
            }
        }
        Ok(())
    }

    fn get_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        self.block_on(self.fetch_job_execution(id))
    }

    fn find_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        self.block_on(self.fetch_job_executions(instance_id))
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let Some(instance) = self.get_job_instance(job_name, parameters)? else {
            return Ok(None);
        };
        let executions = self.find_job_executions(instance.id)?;
        Ok(executions
            .into_iter()
            .max_by_key(|e| (e.start_time.unwrap_or(e.create_time), e.id)))
    }

    fn save_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        self.block_on(self.insert_step_execution(step))
    }

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        self.block_on(self.write_step_execution(step, false))
    }

    fn get_step_execution(
        &self,
        id: StepExecutionId,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        self.block_on(self.fetch_step_execution(id))
    }

    fn find_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        self.block_on(self.fetch_step_executions(job_execution_id))
    }

    fn get_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        self.block_on(self.fetch_last_step_execution(instance_id, step_name))
    }

    fn step_execution_count(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<usize, RepositoryError> {
        self.block_on(self.count_step_executions(instance_id, step_name))
    }

    fn update_step_execution_context(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let id = step.id.ok_or_else(|| {
            RepositoryError::InvalidArgument("step execution has not been saved".to_string())
        })?;
        self.block_on(self.write_context(id.get(), OwnerType::Step, &step.execution_context))
    }

    fn update_job_execution_context(
        &self,
        execution: &JobExecution,
    ) -> Result<(), RepositoryError> {
        let id = execution.id.ok_or_else(|| {
            RepositoryError::InvalidArgument("job execution has not been saved".to_string())
        })?;
        self.block_on(self.write_context(id.get(), OwnerType::Job, &execution.execution_context))
    }

    fn checkpoint_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        self.block_on(self.write_step_execution(step, true))
    }
}

#[async_trait::async_trait]
impl JobExplorer for PostgresJobRepository {
    async fn job_names(&self) -> Result<Vec<String>, RepositoryError> {
        sqlx::query_scalar("SELECT DISTINCT job_name FROM batch_job_instance ORDER BY job_name")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_names", e))
    }

    async fn find_job_instances(
        &self,
        job_name: &str,
        pagination: Pagination,
    ) -> Result<Vec<JobInstance>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_name, job_key, version
            FROM batch_job_instance
            WHERE job_name = $1
            ORDER BY id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(job_name)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_job_instances", e))?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn find_running_job_executions(
        &self,
        job_name: &str,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_EXECUTION_COLUMNS} \
             WHERE i.job_name = $1 AND e.status IN ('STARTING', 'STARTED', 'STOPPING') \
             ORDER BY e.id DESC"
        ))
        .bind(job_name)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_running_job_executions", e))?;
        rows.iter().map(job_execution_from_row).collect()
    }

    async fn execution_summary(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<ExecutionSummary>, RepositoryError> {
        let Some(execution) = self.fetch_job_execution(id).await? else {
            return Ok(None);
        };
        let steps = self.fetch_step_executions(id).await?;
        Ok(Some(ExecutionSummary { execution, steps }))
    }
}
