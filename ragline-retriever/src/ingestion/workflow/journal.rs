//! Execution and step-log persistence.
//!
//! Lives in the same SQLite database as the index. The journal only records
//! what happened; deciding what to run next is the engine's job.

use super::WorkflowError;
use super::state::{ExecutionRecord, ExecutionState, FileOutcome, Step, StepRecord};
use crate::ingestion::discovery::FileDescriptor;
use crate::storage::SqliteStore;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

type Result<T> = std::result::Result<T, WorkflowError>;

const NON_TERMINAL: &str = "('PENDING', 'RUNNING', 'CHECKPOINTED')";

#[derive(Clone, Debug)]
pub struct WorkflowJournal {
    pool: SqlitePool,
}

impl WorkflowJournal {
    pub fn new(store: &SqliteStore) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE execution_id = ?1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| execution_from_row(&r)).transpose()
    }

    /// Create the execution for `file` in `PENDING`, or return the existing
    /// one. An existing execution keeps its state; only the path it was last
    /// seen at and the run that saw it are updated.
    pub async fn ensure_pending(
        &self,
        file: &FileDescriptor,
        run_id: Option<&str>,
    ) -> Result<ExecutionRecord> {
        let execution_id = file.execution_id();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (execution_id, file_path, file_hash, file_size, state, last_run_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?6, ?6)
            ON CONFLICT(execution_id) DO UPDATE SET
                file_path = excluded.file_path,
                last_run_id = COALESCE(excluded.last_run_id, workflow_executions.last_run_id),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&execution_id)
        .bind(file.path_string())
        .bind(file.hash_hex())
        .bind(file.size as i64)
        .bind(run_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&execution_id)
            .await?
            .ok_or(WorkflowError::ExecutionNotFound(execution_id))
    }

    /// Move a non-terminal execution to `RUNNING`. Returns false if it is
    /// no longer non-terminal (cancelled in the meantime).
    pub async fn mark_running(&self, execution_id: &str) -> Result<bool> {
        let updated = sqlx::query(&format!(
            "UPDATE workflow_executions
             SET state = 'RUNNING', attempt_count = attempt_count + 1, updated_at = ?1
             WHERE execution_id = ?2 AND state IN {NON_TERMINAL}"
        ))
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn is_cancelled(&self, execution_id: &str) -> Result<bool> {
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM workflow_executions WHERE execution_id = ?1")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(state.as_deref() == Some("CANCELLED"))
    }

    /// Commit the output of `step` and move the execution to
    /// `CHECKPOINTED(step)` in one transaction.
    ///
    /// The step row is written even if the execution was cancelled while the
    /// step ran; the state is left `CANCELLED` and false is returned.
    pub async fn checkpoint(
        &self,
        execution_id: &str,
        step: Step,
        output: &serde_json::Value,
        attempts: u32,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_steps (execution_id, step, step_order, status, output_json, attempts, completed_at)
            VALUES (?1, ?2, ?3, 'COMPLETED', ?4, ?5, ?6)
            ON CONFLICT(execution_id, step) DO UPDATE SET
                output_json = excluded.output_json,
                attempts = excluded.attempts,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(execution_id)
        .bind(step.as_str())
        .bind(step.order() as i64)
        .bind(serde_json::to_string(output)?)
        .bind(attempts as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE workflow_executions
             SET state = 'CHECKPOINTED', current_step = ?1, updated_at = ?2
             WHERE execution_id = ?3 AND state != 'CANCELLED'",
        )
        .bind(step.as_str())
        .bind(now)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(updated > 0)
    }

    /// Committed checkpoints in step order.
    pub async fn completed_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            "SELECT step, output_json, attempts, completed_at FROM workflow_steps
             WHERE execution_id = ?1 ORDER BY step_order",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StepRecord> {
                let step: String = row.try_get("step")?;
                let output: String = row.try_get("output_json")?;
                let attempts: i64 = row.try_get("attempts")?;
                Ok(StepRecord {
                    step: step.parse()?,
                    output: serde_json::from_str(&output)?,
                    attempts: attempts as u32,
                    completed_at: row.try_get("completed_at")?,
                })
            })
            .collect()
    }

    /// Drop the checkpoints of `from` and every later step and bump the fork
    /// counter. The execution ends up `CHECKPOINTED` at the step before
    /// `from`, or `PENDING` when forking from the first step.
    pub async fn fork_from(&self, execution_id: &str, from: Step) -> Result<u64> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let dropped = sqlx::query(
            "DELETE FROM workflow_steps WHERE execution_id = ?1 AND step_order >= ?2",
        )
        .bind(execution_id)
        .bind(from.order() as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let previous = (from.order() > 1).then(|| Step::ALL[from.order() as usize - 2]);
        sqlx::query(
            "UPDATE workflow_executions
             SET state = ?1, current_step = ?2, failure_kind = NULL, error = NULL,
                 output_json = NULL, fork_count = fork_count + 1, updated_at = ?3
             WHERE execution_id = ?4",
        )
        .bind(if previous.is_some() { "CHECKPOINTED" } else { "PENDING" })
        .bind(previous.map(|s| s.as_str()))
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(dropped)
    }

    /// Put a cancelled or failed execution back in line without touching
    /// its checkpoints.
    pub async fn reopen(&self, execution_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE workflow_executions
             SET state = 'PENDING', failure_kind = NULL, error = NULL, output_json = NULL,
                 updated_at = ?1
             WHERE execution_id = ?2",
        )
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a terminal state. A cancelled execution stays cancelled;
    /// returns false in that case.
    pub async fn finish(
        &self,
        execution_id: &str,
        state: ExecutionState,
        output: Option<&FileOutcome>,
        error: Option<&str>,
    ) -> Result<bool> {
        let failure_kind = match state {
            ExecutionState::Failed(kind) => Some(kind.as_str()),
            _ => None,
        };
        let output_json = output.map(serde_json::to_string).transpose()?;
        let updated = sqlx::query(
            "UPDATE workflow_executions
             SET state = ?1, failure_kind = ?2, error = ?3, output_json = ?4, updated_at = ?5
             WHERE execution_id = ?6 AND state != 'CANCELLED'",
        )
        .bind(state.label())
        .bind(failure_kind)
        .bind(error)
        .bind(output_json)
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Cancel a non-terminal execution. Returns false if it was already
    /// terminal.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        let updated = sqlx::query(&format!(
            "UPDATE workflow_executions SET state = 'CANCELLED', updated_at = ?1
             WHERE execution_id = ?2 AND state IN {NON_TERMINAL}"
        ))
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Executions, optionally only those last touched by `run_id`.
    pub async fn list(&self, run_id: Option<&str>) -> Result<Vec<ExecutionRecord>> {
        let rows = match run_id {
            Some(run_id) => {
                sqlx::query(
                    "SELECT * FROM workflow_executions WHERE last_run_id = ?1
                     ORDER BY file_path, execution_id",
                )
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM workflow_executions ORDER BY file_path, execution_id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(execution_from_row).collect()
    }

    /// Executions a crash left behind.
    pub async fn list_incomplete(&self) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM workflow_executions WHERE state IN {NON_TERMINAL}
             ORDER BY created_at, execution_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }
}

fn execution_from_row(row: &SqliteRow) -> Result<ExecutionRecord> {
    let state: String = row.try_get("state")?;
    let current_step: Option<String> = row.try_get("current_step")?;
    let failure_kind: Option<String> = row.try_get("failure_kind")?;
    let output_json: Option<String> = row.try_get("output_json")?;
    let file_size: i64 = row.try_get("file_size")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let fork_count: i64 = row.try_get("fork_count")?;

    Ok(ExecutionRecord {
        execution_id: row.try_get("execution_id")?,
        file_path: row.try_get("file_path")?,
        file_hash: row.try_get("file_hash")?,
        file_size: file_size as u64,
        state: ExecutionState::from_columns(
            &state,
            current_step.as_deref(),
            failure_kind.as_deref(),
        )?,
        error: row.try_get("error")?,
        output: output_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        last_run_id: row.try_get("last_run_id")?,
        attempt_count: attempt_count as u32,
        fork_count: fork_count as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
