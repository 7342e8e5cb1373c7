use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use sluice_core::error::AppError;
use sluice_core::models::{CollectorState, NewStagingRow, RunCommit, StagingRow};
use sluice_core::traits::StagingStore;

/// PostgreSQL staging table with run-scoped visibility.
///
/// Rows are inserted uncommitted under their run id. `commit_run` flips
/// them visible and, for a full run, deletes the previously committed rows
/// in the same transaction. Other runs still staging are untouched.
#[derive(Clone)]
pub struct StagingRepository {
    pool: Pool<Postgres>,
}

impl StagingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Uncommitted rows of a partition (runs in flight or abandoned).
    pub async fn count_uncommitted(&self, partition_key: &str) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM staging_rows WHERE partition_key = $1 AND NOT committed"#,
        )
        .bind(partition_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.0)
    }

    /// Delete uncommitted rows older than `cutoff`, left behind by runs whose
    /// process died before it could commit or abort.
    pub async fn discard_abandoned(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"DELETE FROM staging_rows WHERE NOT committed AND created_at < $1"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct StagingRowRecord {
    id: i64,
    partition_key: String,
    run_id: Uuid,
    params: serde_json::Value,
    input: serde_json::Value,
    data: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl From<StagingRowRecord> for StagingRow {
    fn from(row: StagingRowRecord) -> Self {
        StagingRow {
            id: row.id,
            partition_key: row.partition_key,
            run_id: row.run_id,
            params: row.params,
            input: row.input,
            data: row.data,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CollectorStateRecord {
    partition_key: String,
    cursor_at: Option<DateTime<Utc>>,
    time_after: Option<DateTime<Utc>>,
    latest_run_id: Option<Uuid>,
    updated_at: DateTime<Utc>,
}

impl From<CollectorStateRecord> for CollectorState {
    fn from(row: CollectorStateRecord) -> Self {
        CollectorState {
            partition_key: row.partition_key,
            cursor: row.cursor_at,
            time_after: row.time_after,
            latest_run_id: row.latest_run_id,
            updated_at: row.updated_at,
        }
    }
}

impl StagingStore for StagingRepository {
    async fn collector_state(&self, partition_key: &str) -> Result<Option<CollectorState>, AppError> {
        let row = sqlx::query_as::<_, CollectorStateRecord>(
            r#"
            SELECT partition_key, cursor_at, time_after, latest_run_id, updated_at
            FROM collector_state
            WHERE partition_key = $1
            "#,
        )
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn upsert_page(&self, row: &NewStagingRow) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO staging_rows (partition_key, run_id, request_key, params, input, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (partition_key, run_id, request_key)
            DO UPDATE SET params = EXCLUDED.params, input = EXCLUDED.input, data = EXCLUDED.data
            "#,
        )
        .bind(&row.partition_key)
        .bind(row.run_id)
        .bind(&row.request_key)
        .bind(&row.params)
        .bind(&row.input)
        .bind(&row.data)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn commit_run(&self, commit: &RunCommit) -> Result<u64, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let superseded = if commit.replace {
            sqlx::query(
                r#"DELETE FROM staging_rows WHERE partition_key = $1 AND run_id <> $2 AND committed"#,
            )
                .bind(&commit.partition_key)
                .bind(commit.run_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?
                .rows_affected()
        } else {
            0
        };

        sqlx::query(
            r#"UPDATE staging_rows SET committed = TRUE WHERE partition_key = $1 AND run_id = $2"#,
        )
        .bind(&commit.partition_key)
        .bind(commit.run_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO collector_state (partition_key, cursor_at, time_after, latest_run_id, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (partition_key)
            DO UPDATE SET cursor_at = EXCLUDED.cursor_at,
                          time_after = EXCLUDED.time_after,
                          latest_run_id = EXCLUDED.latest_run_id,
                          updated_at = NOW()
            "#,
        )
        .bind(&commit.partition_key)
        .bind(commit.cursor)
        .bind(commit.time_after)
        .bind(commit.run_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(
            partition = %commit.partition_key,
            run_id = %commit.run_id,
            superseded,
            "Committed staging run"
        );
        Ok(superseded)
    }

    async fn abort_run(&self, partition_key: &str, run_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM staging_rows
            WHERE partition_key = $1 AND run_id = $2 AND NOT committed
            "#,
        )
        .bind(partition_key)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn load_partition(&self, partition_key: &str) -> Result<Vec<StagingRow>, AppError> {
        let rows = sqlx::query_as::<_, StagingRowRecord>(
            r#"
            SELECT id, partition_key, run_id, params, input, data, created_at
            FROM staging_rows
            WHERE partition_key = $1 AND committed
            ORDER BY id ASC
            "#,
        )
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
