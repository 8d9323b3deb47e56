//! SQLite-backed repository.
//!
//! Schema is initialized on open, so a fresh database file (or an
//! in-memory database in tests) is immediately usable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::core::errors::{EngineError, Result};
use crate::engine::state::{
    RunError, RunStatus, StepStatus, WorkflowRun, WorkflowStep,
};
use crate::storage::{Page, WorkflowRepository};

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Opens (creating if needed) the database at `database_url` and
    /// initializes the schema.
    pub async fn new(database_url: &str) -> Result<Self> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite:{database_url}")
        };

        // An in-memory database exists per connection; more than one
        // connection would see an empty schema.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;

        Self::initialize_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                definition_id TEXT NOT NULL,
                definition_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT,
                error_message TEXT,
                error_code TEXT,
                engine_state TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                suspended_at TEXT,
                resumed_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_steps (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_kind TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                status TEXT NOT NULL,
                input TEXT,
                output TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_runs_status_updated ON workflow_runs(status, updated_at)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_runs_definition ON workflow_runs(definition_id)",
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_steps_run_id ON workflow_steps(run_id)")
            .execute(pool)
            .await?;

        info!("workflow repository schema initialized");
        Ok(())
    }
}

fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn decode_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::invalid_state(format!("malformed timestamp '{text}': {e}")))
}

fn decode_opt_ts(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.as_deref().map(decode_ts).transpose()
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun> {
    let status_text: String = row.try_get("status")?;
    let status = RunStatus::parse(&status_text)
        .ok_or_else(|| EngineError::invalid_state(format!("unknown run status '{status_text}'")))?;

    let input_text: String = row.try_get("input")?;
    let output_text: Option<String> = row.try_get("output")?;
    let engine_state_text: Option<String> = row.try_get("engine_state")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    let error_code: Option<String> = row.try_get("error_code")?;

    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(WorkflowRun {
        id: row.try_get("id")?,
        definition_id: row.try_get("definition_id")?,
        definition_version: row.try_get::<i64, _>("definition_version")? as u32,
        status,
        input: serde_json::from_str(&input_text)?,
        output: output_text.as_deref().map(serde_json::from_str).transpose()?,
        error: match (error_message, error_code) {
            (Some(message), Some(code)) => Some(RunError { message, code }),
            _ => None,
        },
        engine_state: engine_state_text
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
        started_at: decode_opt_ts(row.try_get("started_at")?)?,
        completed_at: decode_opt_ts(row.try_get("completed_at")?)?,
        suspended_at: decode_opt_ts(row.try_get("suspended_at")?)?,
        resumed_at: decode_opt_ts(row.try_get("resumed_at")?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<WorkflowStep> {
    let status_text: String = row.try_get("status")?;
    let status = StepStatus::parse(&status_text).ok_or_else(|| {
        EngineError::invalid_state(format!("unknown step status '{status_text}'"))
    })?;

    let input_text: Option<String> = row.try_get("input")?;
    let output_text: Option<String> = row.try_get("output")?;
    let started_at: String = row.try_get("started_at")?;

    Ok(WorkflowStep {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        node_id: row.try_get("node_id")?,
        node_kind: row.try_get("node_kind")?,
        sequence: row.try_get::<i64, _>("sequence")? as u32,
        status,
        input: input_text.as_deref().map(serde_json::from_str).transpose()?,
        output: output_text.as_deref().map(serde_json::from_str).transpose()?,
        error: row.try_get("error")?,
        started_at: decode_ts(&started_at)?,
        completed_at: decode_opt_ts(row.try_get("completed_at")?)?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

#[async_trait]
impl WorkflowRepository for SqliteRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                id, definition_id, definition_version, status, input, output,
                error_message, error_code, engine_state,
                created_at, updated_at, started_at, completed_at, suspended_at, resumed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.definition_id)
        .bind(run.definition_version as i64)
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.input)?)
        .bind(run.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(run.error.as_ref().map(|e| e.message.clone()))
        .bind(run.error.as_ref().map(|e| e.code.clone()))
        .bind(
            run.engine_state
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(encode_ts(&run.created_at))
        .bind(encode_ts(&run.updated_at))
        .bind(run.started_at.as_ref().map(encode_ts))
        .bind(run.completed_at.as_ref().map(encode_ts))
        .bind(run.suspended_at.as_ref().map(encode_ts))
        .bind(run.resumed_at.as_ref().map(encode_ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_runs SET
                status = ?, input = ?, output = ?, error_message = ?, error_code = ?,
                engine_state = ?, updated_at = ?, started_at = ?, completed_at = ?,
                suspended_at = ?, resumed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(serde_json::to_string(&run.input)?)
        .bind(run.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(run.error.as_ref().map(|e| e.message.clone()))
        .bind(run.error.as_ref().map(|e| e.code.clone()))
        .bind(
            run.engine_state
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(encode_ts(&Utc::now()))
        .bind(run.started_at.as_ref().map(encode_ts))
        .bind(run.completed_at.as_ref().map(encode_ts))
        .bind(run.suspended_at.as_ref().map(encode_ts))
        .bind(run.resumed_at.as_ref().map(encode_ts))
        .bind(&run.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(
        &self,
        definition_id: Option<&str>,
        page: Page,
    ) -> Result<Vec<WorkflowRun>> {
        let rows = match definition_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM workflow_runs WHERE definition_id = ? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(id)
                .bind(page.limit as i64)
                .bind(page.offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM workflow_runs ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(page.limit as i64)
                .bind(page.offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(run_from_row).collect()
    }

    async fn list_stale(
        &self,
        status: RunStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE status = ? AND updated_at < ? \
             ORDER BY updated_at ASC",
        )
        .bind(status.as_str())
        .bind(encode_ts(&cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn append_step(&self, step: &WorkflowStep) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_steps (
                id, run_id, node_id, node_kind, sequence, status,
                input, output, error, started_at, completed_at, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&step.id)
        .bind(&step.run_id)
        .bind(&step.node_id)
        .bind(&step.node_kind)
        .bind(step.sequence as i64)
        .bind(step.status.as_str())
        .bind(step.input.as_ref().map(serde_json::to_string).transpose()?)
        .bind(step.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(step.error.as_deref())
        .bind(encode_ts(&step.started_at))
        .bind(step.completed_at.as_ref().map(encode_ts))
        .bind(step.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_step(&self, step: &WorkflowStep) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_steps SET
                status = ?, output = ?, error = ?, completed_at = ?, duration_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(step.status.as_str())
        .bind(step.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(step.error.as_deref())
        .bind(step.completed_at.as_ref().map(encode_ts))
        .bind(step.duration_ms)
        .bind(&step.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_steps(&self, run_id: &str, page: Page) -> Result<Vec<WorkflowStep>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_steps WHERE run_id = ? \
             ORDER BY sequence ASC LIMIT ? OFFSET ?",
        )
        .bind(run_id)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(step_from_row).collect()
    }
}
