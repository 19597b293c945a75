//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Claims and promotions
//! are single statements; operations touching several rows run in one
//! transaction whose first statement is a write, so the transaction holds the
//! database write lock from the start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Executor, QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{JobStore, StorageError};
use crate::core::job::{
    FailureOutcome, JobFilter, JobRecord, JobState, NewJob, ParseJobStateError, StateCounts,
};
use crate::core::recurring::RecurringDefinition;
use crate::core::types::{JobId, QueueName, RecurringKey};

const JOB_COLUMNS: &str = "id, job_type, arguments, queue, state, fire_at, continuation_of, \
    recurring_key, concurrency_key, attempt, retry_of, last_error, seq, created_at, updated_at, \
    claimed_at, heartbeat_at, finished_at";

const RECURRING_COLUMNS: &str = "key, job_type, arguments, queue, schedule_expression, timezone, \
    next_fire_at, last_fired_at, last_job_id, created_at, updated_at";

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?
            .busy_timeout(BUSY_TIMEOUT);

        // Every connection to ":memory:" is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Error for a transition that matched no row.
    async fn transition_error(&self, id: &JobId, to: JobState) -> StorageError {
        let row = sqlx::query("SELECT state FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await;
        match row {
            Ok(Some(row)) => match column::<String>(&row, "state").and_then(|s| parse_state(&s)) {
                Ok(from) => StorageError::InvalidTransition {
                    id: id.clone(),
                    from,
                    to,
                },
                Err(e) => e,
            },
            Ok(None) => StorageError::job_not_found(id),
            Err(e) => db_error(e),
        }
    }

    async fn job_exists(&self, id: &JobId) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.is_some())
    }

    /// Run a single-row transition and map a miss to the matching error.
    async fn update_one<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        id: &JobId,
        to: JobState,
    ) -> Result<JobRecord, StorageError> {
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.transition_error(id, to).await),
        }
    }
}

fn db_error(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StorageError::DuplicateKey(db.message().to_string());
        }
        // SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
        let locked = db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6));
        if locked {
            return StorageError::Unavailable(db.message().to_string());
        }
    }
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::Unavailable(e.to_string()),
        other => StorageError::Other(other.to_string()),
    }
}

// Helper functions for column conversion
fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StorageError::Serialization(format!("column {}: {}", name, e)))
}

fn millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Serialization(format!("invalid timestamp: {}", ms)))
}

fn optional_time(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StorageError> {
    ms.map(from_millis).transpose()
}

fn parse_state(s: &str) -> Result<JobState, StorageError> {
    s.parse()
        .map_err(|e: ParseJobStateError| StorageError::Serialization(e.to_string()))
}

fn parse_job_id(s: &str) -> Result<JobId, StorageError> {
    JobId::parse(s).map_err(|e| StorageError::Serialization(format!("invalid job id: {}", e)))
}

fn optional_job_id(s: Option<String>) -> Result<Option<JobId>, StorageError> {
    s.as_deref().map(parse_job_id).transpose()
}

fn to_json(value: &serde_json::Value) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json(s: &str) -> Result<serde_json::Value, StorageError> {
    serde_json::from_str(s).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord, StorageError> {
    let attempt: i64 = column(row, "attempt")?;
    Ok(JobRecord {
        id: parse_job_id(&column::<String>(row, "id")?)?,
        job_type: column(row, "job_type")?,
        arguments: from_json(&column::<String>(row, "arguments")?)?,
        queue: QueueName::new(column::<String>(row, "queue")?),
        state: parse_state(&column::<String>(row, "state")?)?,
        fire_at: from_millis(column(row, "fire_at")?)?,
        continuation_of: optional_job_id(column(row, "continuation_of")?)?,
        recurring_key: column::<Option<String>>(row, "recurring_key")?.map(RecurringKey::new),
        concurrency_key: column(row, "concurrency_key")?,
        attempt: u32::try_from(attempt)
            .map_err(|_| StorageError::Serialization(format!("invalid attempt: {}", attempt)))?,
        retry_of: optional_job_id(column(row, "retry_of")?)?,
        last_error: column(row, "last_error")?,
        sequence: column(row, "seq")?,
        created_at: from_millis(column(row, "created_at")?)?,
        updated_at: from_millis(column(row, "updated_at")?)?,
        claimed_at: optional_time(column(row, "claimed_at")?)?,
        heartbeat_at: optional_time(column(row, "heartbeat_at")?)?,
        finished_at: optional_time(column(row, "finished_at")?)?,
    })
}

fn recurring_from_row(row: &SqliteRow) -> Result<RecurringDefinition, StorageError> {
    Ok(RecurringDefinition {
        key: RecurringKey::new(column::<String>(row, "key")?),
        job_type: column(row, "job_type")?,
        arguments: from_json(&column::<String>(row, "arguments")?)?,
        queue: QueueName::new(column::<String>(row, "queue")?),
        schedule_expression: column(row, "schedule_expression")?,
        timezone: column(row, "timezone")?,
        next_fire_at: from_millis(column(row, "next_fire_at")?)?,
        last_fired_at: optional_time(column(row, "last_fired_at")?)?,
        last_job_id: optional_job_id(column(row, "last_job_id")?)?,
        created_at: from_millis(column(row, "created_at")?)?,
        updated_at: from_millis(column(row, "updated_at")?)?,
    })
}

/// Ids of `RETURNING id, seq` rows in insertion order.
fn ids_in_order(rows: &[SqliteRow]) -> Result<Vec<JobId>, StorageError> {
    let mut ids = rows
        .iter()
        .map(|row| Ok((column::<i64>(row, "seq")?, column::<String>(row, "id")?)))
        .collect::<Result<Vec<_>, StorageError>>()?;
    ids.sort();
    ids.into_iter().map(|(_, id)| parse_job_id(&id)).collect()
}

/// Insert a job, computing its initial state from its parent in the same
/// statement. Returns `None` when the parent does not exist.
async fn insert_job<'e, E>(
    executor: E,
    job: &NewJob,
    now: DateTime<Utc>,
) -> Result<Option<JobRecord>, StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        INSERT INTO jobs (id, job_type, arguments, queue, state, fire_at, continuation_of,
                          recurring_key, concurrency_key, attempt, retry_of, created_at, updated_at)
        SELECT ?, ?, ?, ?,
               CASE WHEN ? <= ? AND (? IS NULL OR EXISTS (
                        SELECT 1 FROM jobs p WHERE p.id = ? AND p.state = 'succeeded'))
                    THEN 'enqueued' ELSE 'scheduled' END,
               ?, ?, ?, ?, ?, ?, ?, ?
        WHERE ? IS NULL OR EXISTS (SELECT 1 FROM jobs p WHERE p.id = ?)
        RETURNING {}
        "#,
        JOB_COLUMNS
    );

    let fire_at = millis(job.fire_at.unwrap_or(now));
    let parent = job.continuation_of.as_ref().map(|id| id.to_string());
    let row = sqlx::query(&sql)
        .bind(JobId::new().to_string())
        .bind(&job.job_type)
        .bind(to_json(&job.arguments)?)
        .bind(job.queue.as_str())
        .bind(fire_at)
        .bind(millis(now))
        .bind(parent.clone())
        .bind(parent.clone())
        .bind(fire_at)
        .bind(parent.clone())
        .bind(job.recurring_key.as_ref().map(|k| k.as_str().to_string()))
        .bind(job.concurrency_key())
        .bind(i64::from(job.attempt))
        .bind(job.retry_of.as_ref().map(|id| id.to_string()))
        .bind(millis(now))
        .bind(millis(now))
        .bind(parent.clone())
        .bind(parent)
        .fetch_optional(executor)
        .await
        .map_err(db_error)?;

    row.as_ref().map(job_from_row).transpose()
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        match (insert_job(&self.pool, &job, now).await?, &job.continuation_of) {
            (Some(record), _) => Ok(record),
            (None, Some(parent)) => Err(StorageError::job_not_found(parent)),
            (None, None) => Err(StorageError::Other("job not created".into())),
        }
    }

    async fn get_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StorageError::job_not_found(id))?;
        job_from_row(&row)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StorageError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM jobs WHERE 1 = 1", JOB_COLUMNS));
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(queue) = &filter.queue {
            query.push(" AND queue = ").push_bind(queue.as_str().to_string());
        }
        if let Some(job_type) = &filter.job_type {
            query.push(" AND job_type = ").push_bind(job_type.clone());
        }
        query.push(" ORDER BY seq");
        if let Some(limit) = filter.limit {
            query
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_next_ready(
        &self,
        queue: &QueueName,
        concurrency_key: &str,
        max_concurrent: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'processing', claimed_at = ?, heartbeat_at = ?, updated_at = ?
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE state = 'enqueued' AND queue = ? AND concurrency_key = ? AND fire_at <= ?
                ORDER BY fire_at, seq
                LIMIT 1
            )
            AND state = 'enqueued'
            AND (SELECT COUNT(*) FROM jobs WHERE state = 'processing' AND concurrency_key = ?) < ?
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let now = millis(now);
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(queue.as_str())
            .bind(concurrency_key)
            .bind(now)
            .bind(concurrency_key)
            .bind(i64::try_from(max_concurrent).unwrap_or(i64::MAX))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_succeeded(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StorageError> {
        let sql = format!(
            "UPDATE jobs SET state = 'succeeded', finished_at = ?, updated_at = ? \
             WHERE id = ? AND state = 'processing' RETURNING {}",
            JOB_COLUMNS
        );
        let query = sqlx::query(&sql)
            .bind(millis(now))
            .bind(millis(now))
            .bind(id.to_string());
        self.update_one(query, id, JobState::Succeeded).await
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query(&format!(
            "UPDATE jobs SET state = 'failed', last_error = ?, finished_at = ?, updated_at = ? \
             WHERE id = ? AND state = 'processing' RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(error)
        .bind(millis(now))
        .bind(millis(now))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            // Release the connection before looking up the reason.
            drop(tx);
            return Err(self.transition_error(id, JobState::Failed).await);
        };
        let failed = job_from_row(&row)?;

        let Some(retry_at) = retry_at else {
            tx.commit().await.map_err(db_error)?;
            return Ok(FailureOutcome {
                failed,
                retry: None,
                moved_continuations: Vec::new(),
            });
        };

        let retry = insert_job(&mut *tx, &failed.next_attempt(retry_at), now)
            .await?
            .ok_or_else(|| StorageError::Other(format!("retry of job {} not created", id)))?;

        let moved = sqlx::query(
            "UPDATE jobs SET continuation_of = ?, updated_at = ? \
             WHERE continuation_of = ? AND state = 'scheduled' RETURNING id, seq",
        )
        .bind(retry.id.to_string())
        .bind(millis(now))
        .bind(id.to_string())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;
        let moved_continuations = ids_in_order(&moved)?;

        tx.commit().await.map_err(db_error)?;
        Ok(FailureOutcome {
            failed,
            retry: Some(retry),
            moved_continuations,
        })
    }

    async fn promote_scheduled_to_enqueued(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs SET state = 'enqueued', updated_at = ?
            WHERE state = 'scheduled' AND fire_at <= ?
              AND (continuation_of IS NULL OR EXISTS (
                    SELECT 1 FROM jobs p WHERE p.id = jobs.continuation_of AND p.state = 'succeeded'))
            RETURNING id, seq
            "#,
        )
        .bind(millis(now))
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        ids_in_order(&rows)
    }

    async fn promote_continuations(
        &self,
        parent: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs SET state = 'enqueued', updated_at = ?
            WHERE state = 'scheduled' AND continuation_of = ? AND fire_at <= ?
              AND EXISTS (SELECT 1 FROM jobs p WHERE p.id = ? AND p.state = 'succeeded')
            RETURNING id, seq
            "#,
        )
        .bind(millis(now))
        .bind(parent.to_string())
        .bind(millis(now))
        .bind(parent.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        if rows.is_empty() && !self.job_exists(parent).await? {
            return Err(StorageError::job_not_found(parent));
        }
        ids_in_order(&rows)
    }

    async fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        let sql = format!(
            "UPDATE jobs SET state = 'enqueued', claimed_at = NULL, heartbeat_at = NULL, \
             updated_at = ? WHERE id = ? AND state = 'processing' RETURNING {}",
            JOB_COLUMNS
        );
        let query = sqlx::query(&sql).bind(millis(now)).bind(id.to_string());
        self.update_one(query, id, JobState::Enqueued).await
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE jobs SET heartbeat_at = ? WHERE id = ? AND state = 'processing'")
                .bind(millis(now))
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, JobState::Processing).await);
        }
        Ok(())
    }

    async fn requeue_abandoned(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'enqueued', claimed_at = NULL, heartbeat_at = NULL, updated_at = ?
            WHERE state = 'processing'
              AND COALESCE(heartbeat_at, claimed_at, updated_at) < ?
            RETURNING id, seq
            "#,
        )
        .bind(millis(now))
        .bind(millis(stale_before))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        ids_in_order(&rows)
    }

    async fn delete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        let sql = format!(
            "UPDATE jobs SET state = 'deleted', finished_at = ?, updated_at = ? \
             WHERE id = ? AND state IN ('scheduled', 'enqueued', 'failed') RETURNING {}",
            JOB_COLUMNS
        );
        let query = sqlx::query(&sql)
            .bind(millis(now))
            .bind(millis(now))
            .bind(id.to_string());
        self.update_one(query, id, JobState::Deleted).await
    }

    async fn count_by_state(&self) -> Result<StateCounts, StorageError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let mut counts = StateCounts::default();
        for row in &rows {
            let state = parse_state(&column::<String>(row, "state")?)?;
            let total: i64 = column(row, "total")?;
            counts.add(state, u64::try_from(total).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn upsert_recurring(
        &self,
        definition: RecurringDefinition,
    ) -> Result<RecurringDefinition, StorageError> {
        let sql = format!(
            r#"
            INSERT INTO recurring_jobs ({})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                job_type = excluded.job_type,
                arguments = excluded.arguments,
                queue = excluded.queue,
                next_fire_at = CASE
                    WHEN recurring_jobs.schedule_expression = excluded.schedule_expression
                     AND recurring_jobs.timezone = excluded.timezone
                    THEN recurring_jobs.next_fire_at
                    ELSE excluded.next_fire_at END,
                schedule_expression = excluded.schedule_expression,
                timezone = excluded.timezone,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            RECURRING_COLUMNS, RECURRING_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(definition.key.as_str())
            .bind(&definition.job_type)
            .bind(to_json(&definition.arguments)?)
            .bind(definition.queue.as_str())
            .bind(&definition.schedule_expression)
            .bind(&definition.timezone)
            .bind(millis(definition.next_fire_at))
            .bind(definition.last_fired_at.map(millis))
            .bind(definition.last_job_id.as_ref().map(|id| id.to_string()))
            .bind(millis(definition.created_at))
            .bind(millis(definition.updated_at))
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        recurring_from_row(&row)
    }

    async fn get_recurring(
        &self,
        key: &RecurringKey,
    ) -> Result<RecurringDefinition, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM recurring_jobs WHERE key = ?",
            RECURRING_COLUMNS
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| StorageError::recurring_not_found(key))?;

        recurring_from_row(&row)
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringDefinition>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM recurring_jobs ORDER BY key",
            RECURRING_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(recurring_from_row).collect()
    }

    async fn remove_recurring(&self, key: &RecurringKey) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM recurring_jobs WHERE key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::recurring_not_found(key));
        }
        Ok(())
    }

    async fn due_recurring(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringDefinition>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM recurring_jobs WHERE next_fire_at <= ? ORDER BY next_fire_at, key",
            RECURRING_COLUMNS
        ))
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(recurring_from_row).collect()
    }

    async fn fire_recurring(
        &self,
        key: &RecurringKey,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let advanced = sqlx::query(
            "UPDATE recurring_jobs SET next_fire_at = ?, last_fired_at = ?, updated_at = ? \
             WHERE key = ? AND next_fire_at = ?",
        )
        .bind(millis(new_next))
        .bind(millis(now))
        .bind(millis(now))
        .bind(key.as_str())
        .bind(millis(expected_next))
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if advanced.rows_affected() == 0 {
            drop(tx);
            // Surfaces NotFound for a removed definition.
            self.get_recurring(key).await?;
            return Ok(None);
        }

        let record = insert_job(&mut *tx, &job, now)
            .await?
            .ok_or_else(|| StorageError::Other(format!("recurring job {} not created", key)))?;

        sqlx::query("UPDATE recurring_jobs SET last_job_id = ? WHERE key = ?")
            .bind(record.id.to_string())
            .bind(key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(Some(record))
    }
}
