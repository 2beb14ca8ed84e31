//! Store gateway: repository-style access to the four durable entities
//!
//! Owns all row lifetimes. Mutators are idempotent where redelivery can
//! reach them (upserts keyed on external identifiers, compare-and-set
//! status transitions) and run inside a caller-owned transaction so one
//! logical event is one commit.

pub mod migrations;
pub mod rows;
pub mod schema;

pub use rows::{
    DetectionExecutionRow, DetectionResultRow, DetectionStatus, DetectionType, ExecutionRow,
    OperationRow,
};

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::{Error, Result};

/// One transaction over the store; commit after the logical event is done.
pub type StoreTx = sqlx::Transaction<'static, sqlx::Sqlite>;

/// Fields for a new execution row
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub operation_external_id: Uuid,
    pub agent_host: String,
    pub agent_paw: String,
    pub link_id: Uuid,
    pub command: String,
    pub pid: i64,
    pub status: i64,
    pub result_data: serde_json::Value,
    pub agent_reported_at: DateTime<Utc>,
    pub link_state: String,
    pub raw_message: serde_json::Value,
}

/// Fields for a new detection execution row (always inserted `pending`)
#[derive(Debug, Clone)]
pub struct NewDetectionExecution {
    pub execution_id: Uuid,
    pub operation_external_id: Uuid,
    pub detection_type: DetectionType,
    pub detection_platform: String,
    pub detection_config: serde_json::Value,
    pub max_retries: u32,
}

/// Fields for a new detection result row
#[derive(Debug, Clone)]
pub struct NewDetectionResult {
    pub detection_execution_id: Uuid,
    pub detected: Option<bool>,
    pub raw_response: serde_json::Value,
    pub parsed_results: serde_json::Value,
    pub result_timestamp: DateTime<Utc>,
    pub result_source: String,
    pub metadata: serde_json::Value,
}

/// Optional column updates applied together with a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_metadata: Option<serde_json::Value>,
}

/// Async store over a pooled SQLite database
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the configured database URL and run migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| Error::Config(format!("invalid database url: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .connect_with(options)
            .await?;

        migrations::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory store. A single pooled connection keeps every
    /// borrower on the same database.
    pub async fn connect_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::Config(format!("invalid database url: {}", e)))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        migrations::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin one transaction for one logical event
    pub async fn begin(&self) -> Result<StoreTx> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Mutators (transaction-scoped)
    // ------------------------------------------------------------------

    /// Idempotent upsert keyed on `external_id`. `name`/`metadata` are
    /// refreshed only when the stored row is older than `observed_at`;
    /// `created_at` never changes.
    pub async fn upsert_operation(
        tx: &mut StoreTx,
        external_id: Uuid,
        name: &str,
        started_at: DateTime<Utc>,
        metadata: &serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> Result<OperationRow> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO operations (id, external_id, name, started_at, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(external_id) DO UPDATE SET
                 name = excluded.name,
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at
             WHERE operations.updated_at < excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(external_id.to_string())
        .bind(name)
        .bind(fmt_ts(started_at))
        .bind(metadata.to_string())
        .bind(fmt_ts(now))
        .bind(fmt_ts(observed_at))
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query("SELECT * FROM operations WHERE external_id = ?1")
            .bind(external_id.to_string())
            .fetch_one(&mut **tx)
            .await?;
        operation_from_row(&row)
    }

    /// Idempotent on `(operation_external_id, link_id)`. Returns the row and
    /// whether this call created it; a duplicate is the replay path, not an
    /// error.
    pub async fn create_execution_if_absent(
        tx: &mut StoreTx,
        new: NewExecution,
    ) -> Result<(ExecutionRow, bool)> {
        let result = sqlx::query(
            "INSERT INTO executions
                 (id, operation_external_id, agent_host, agent_paw, link_id, command,
                  pid, status, result_data, agent_reported_at, link_state, raw_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(operation_external_id, link_id) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(new.operation_external_id.to_string())
        .bind(&new.agent_host)
        .bind(&new.agent_paw)
        .bind(new.link_id.to_string())
        .bind(&new.command)
        .bind(new.pid)
        .bind(new.status)
        .bind(new.result_data.to_string())
        .bind(fmt_ts(new.agent_reported_at))
        .bind(&new.link_state)
        .bind(new.raw_message.to_string())
        .bind(fmt_ts(Utc::now()))
        .execute(&mut **tx)
        .await?;

        let created = result.rows_affected() == 1;
        let row = sqlx::query(
            "SELECT * FROM executions WHERE operation_external_id = ?1 AND link_id = ?2",
        )
        .bind(new.operation_external_id.to_string())
        .bind(new.link_id.to_string())
        .fetch_one(&mut **tx)
        .await?;
        Ok((execution_from_row(&row)?, created))
    }

    /// Insert one planned detection attempt in state `pending`
    pub async fn create_detection_execution(
        tx: &mut StoreTx,
        new: NewDetectionExecution,
    ) -> Result<DetectionExecutionRow> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO detection_executions
                 (id, execution_id, operation_external_id, detection_type, detection_platform,
                  detection_config, status, retry_count, max_retries, execution_metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, '{}', ?8)",
        )
        .bind(id.to_string())
        .bind(new.execution_id.to_string())
        .bind(new.operation_external_id.to_string())
        .bind(new.detection_type.as_str())
        .bind(&new.detection_platform)
        .bind(new.detection_config.to_string())
        .bind(i64::from(new.max_retries))
        .bind(fmt_ts(Utc::now()))
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query("SELECT * FROM detection_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_one(&mut **tx)
            .await?;
        detection_execution_from_row(&row)
    }

    /// Compare-and-set status transition. Fails with `Conflict` (carrying
    /// the current status) when the row is in none of `from`, and with
    /// `NotFound` when the row does not exist. The patch may set
    /// `started_at`, `completed_at` and `execution_metadata`.
    pub async fn transition_detection_execution(
        tx: &mut StoreTx,
        id: Uuid,
        from: &[DetectionStatus],
        to: DetectionStatus,
        patch: TransitionPatch,
    ) -> Result<DetectionExecutionRow> {
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE detection_executions SET
                 status = ?,
                 started_at = COALESCE(?, started_at),
                 completed_at = COALESCE(?, completed_at),
                 execution_metadata = COALESCE(?, execution_metadata)
             WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(patch.started_at.map(fmt_ts))
            .bind(patch.completed_at.map(fmt_ts))
            .bind(patch.execution_metadata.map(|m| m.to_string()))
            .bind(id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&mut **tx).await?;
        let row = sqlx::query("SELECT * FROM detection_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await?;

        let Some(row) = row else {
            return Err(Error::NotFound {
                entity: "detection execution",
                id: id.to_string(),
            });
        };
        let row = detection_execution_from_row(&row)?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict {
                id: id.to_string(),
                actual: row.status.to_string(),
            });
        }
        Ok(row)
    }

    /// Bump `retry_count` within the row's budget; used by the worker's
    /// in-process retry loop. Returns the new count.
    pub async fn increment_retry_count(tx: &mut StoreTx, id: Uuid) -> Result<u32> {
        let result = sqlx::query(
            "UPDATE detection_executions SET retry_count = retry_count + 1
             WHERE id = ?1 AND retry_count < max_retries",
        )
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query("SELECT retry_count FROM detection_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await?;
        let Some(row) = row else {
            return Err(Error::NotFound {
                entity: "detection execution",
                id: id.to_string(),
            });
        };
        let count: i64 = row.try_get("retry_count")?;

        if result.rows_affected() == 0 {
            return Err(Error::Constraint(format!(
                "retry budget exhausted for detection execution {} (retry_count={})",
                id, count
            )));
        }
        Ok(count as u32)
    }

    /// Detection executions still `pending` for one execution, inside the
    /// caller's transaction. The ingestion replay path uses this to re-issue
    /// tasks whose publish never succeeded.
    pub async fn pending_detections_for_execution(
        tx: &mut StoreTx,
        execution_id: Uuid,
    ) -> Result<Vec<DetectionExecutionRow>> {
        let rows = sqlx::query(
            "SELECT * FROM detection_executions
             WHERE execution_id = ?1 AND status = 'pending'
             ORDER BY detection_type, detection_platform",
        )
        .bind(execution_id.to_string())
        .fetch_all(&mut **tx)
        .await?;
        rows.iter().map(detection_execution_from_row).collect()
    }

    /// Insert-only; duplicates from replayed responses are kept and visible
    pub async fn append_detection_result(
        tx: &mut StoreTx,
        new: NewDetectionResult,
    ) -> Result<DetectionResultRow> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO detection_results
                 (id, detection_execution_id, detected, raw_response, parsed_results,
                  result_timestamp, result_source, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(id.to_string())
        .bind(new.detection_execution_id.to_string())
        .bind(new.detected)
        .bind(new.raw_response.to_string())
        .bind(new.parsed_results.to_string())
        .bind(fmt_ts(new.result_timestamp))
        .bind(&new.result_source)
        .bind(new.metadata.to_string())
        .bind(fmt_ts(Utc::now()))
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query("SELECT * FROM detection_results WHERE id = ?1")
            .bind(id.to_string())
            .fetch_one(&mut **tx)
            .await?;
        detection_result_from_row(&row)
    }

    // ------------------------------------------------------------------
    // Queries (pool-scoped, feed the external read layer)
    // ------------------------------------------------------------------

    pub async fn operation_by_external_id(&self, external_id: Uuid) -> Result<Option<OperationRow>> {
        let row = sqlx::query("SELECT * FROM operations WHERE external_id = ?1")
            .bind(external_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(operation_from_row).transpose()
    }

    pub async fn execution_by_id(&self, id: Uuid) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    pub async fn execution_by_link(
        &self,
        operation_external_id: Uuid,
        link_id: Uuid,
    ) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query(
            "SELECT * FROM executions WHERE operation_external_id = ?1 AND link_id = ?2",
        )
        .bind(operation_external_id.to_string())
        .bind(link_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    pub async fn detection_execution_by_id(
        &self,
        id: Uuid,
    ) -> Result<Option<DetectionExecutionRow>> {
        let row = sqlx::query("SELECT * FROM detection_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(detection_execution_from_row).transpose()
    }

    pub async fn detection_executions_for_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<DetectionExecutionRow>> {
        let rows = sqlx::query(
            "SELECT * FROM detection_executions WHERE execution_id = ?1
             ORDER BY detection_type, detection_platform",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(detection_execution_from_row).collect()
    }

    pub async fn detection_executions_by_status(
        &self,
        status: DetectionStatus,
    ) -> Result<Vec<DetectionExecutionRow>> {
        let rows = sqlx::query(
            "SELECT * FROM detection_executions WHERE status = ?1 ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(detection_execution_from_row).collect()
    }

    /// Detection executions created in `[from, to)`
    pub async fn detection_executions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DetectionExecutionRow>> {
        let rows = sqlx::query(
            "SELECT * FROM detection_executions
             WHERE created_at >= ?1 AND created_at < ?2 ORDER BY created_at",
        )
        .bind(fmt_ts(from))
        .bind(fmt_ts(to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(detection_execution_from_row).collect()
    }

    /// Results for one detection execution, oldest first. The most recent
    /// row is the final outcome.
    pub async fn detection_results_for(
        &self,
        detection_execution_id: Uuid,
    ) -> Result<Vec<DetectionResultRow>> {
        let rows = sqlx::query(
            "SELECT * FROM detection_results WHERE detection_execution_id = ?1
             ORDER BY created_at, id",
        )
        .bind(detection_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(detection_result_from_row).collect()
    }

    pub async fn count_detections_by_status(&self) -> Result<HashMap<DetectionStatus, i64>> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM detection_executions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let status = DetectionStatus::from_str(&status).map_err(Error::Constraint)?;
            counts.insert(status, n);
        }
        Ok(counts)
    }
}

// ----------------------------------------------------------------------
// Row conversion
// ----------------------------------------------------------------------

fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Constraint(format!("invalid stored timestamp '{}': {}", raw, e)))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Constraint(format!("invalid stored uuid '{}': {}", raw, e)))
}

fn parse_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Constraint(format!("invalid stored json: {}", e)))
}

fn operation_from_row(row: &SqliteRow) -> Result<OperationRow> {
    Ok(OperationRow {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        external_id: parse_uuid(&row.try_get::<String, _>("external_id")?)?,
        name: row.try_get("name")?,
        started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
        metadata: parse_json(&row.try_get::<String, _>("metadata")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<ExecutionRow> {
    Ok(ExecutionRow {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        operation_external_id: parse_uuid(&row.try_get::<String, _>("operation_external_id")?)?,
        agent_host: row.try_get("agent_host")?,
        agent_paw: row.try_get("agent_paw")?,
        link_id: parse_uuid(&row.try_get::<String, _>("link_id")?)?,
        command: row.try_get("command")?,
        pid: row.try_get("pid")?,
        status: row.try_get("status")?,
        result_data: parse_json(&row.try_get::<String, _>("result_data")?)?,
        agent_reported_at: parse_ts(&row.try_get::<String, _>("agent_reported_at")?)?,
        link_state: row.try_get("link_state")?,
        raw_message: parse_json(&row.try_get::<String, _>("raw_message")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn detection_execution_from_row(row: &SqliteRow) -> Result<DetectionExecutionRow> {
    let detection_type: String = row.try_get("detection_type")?;
    let status: String = row.try_get("status")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    Ok(DetectionExecutionRow {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        execution_id: parse_uuid(&row.try_get::<String, _>("execution_id")?)?,
        operation_external_id: parse_uuid(&row.try_get::<String, _>("operation_external_id")?)?,
        detection_type: DetectionType::from_str(&detection_type).map_err(Error::Constraint)?,
        detection_platform: row.try_get("detection_platform")?,
        detection_config: parse_json(&row.try_get::<String, _>("detection_config")?)?,
        status: DetectionStatus::from_str(&status).map_err(Error::Constraint)?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        execution_metadata: parse_json(&row.try_get::<String, _>("execution_metadata")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn detection_result_from_row(row: &SqliteRow) -> Result<DetectionResultRow> {
    Ok(DetectionResultRow {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        detection_execution_id: parse_uuid(
            &row.try_get::<String, _>("detection_execution_id")?,
        )?,
        detected: row.try_get("detected")?,
        raw_response: parse_json(&row.try_get::<String, _>("raw_response")?)?,
        parsed_results: parse_json(&row.try_get::<String, _>("parsed_results")?)?,
        result_timestamp: parse_ts(&row.try_get::<String, _>("result_timestamp")?)?,
        result_source: row.try_get("result_source")?,
        metadata: parse_json(&row.try_get::<String, _>("metadata")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}
