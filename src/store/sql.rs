use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{OutcomeStore, StepOutcome, StepStatus};
use crate::config::STEP_OUTCOMES_TABLE;
use crate::db::Pool;
use crate::db::pool::PoolInner;
use crate::db::schema::column_list;
use crate::error::StoreError;

type OutcomeRow = (
    String,
    String,
    i64,
    String,
    Option<String>,
    String,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
    i64,
);

/// Step outcome store backed by the `step_outcomes` table
///
/// Each append is a single INSERT, committed on its own. The unique index on
/// `(chain_id, step_number)` turns a repeated step into
/// [`StoreError::DuplicateStep`].
#[derive(Debug, Clone)]
pub struct SqlOutcomeStore {
    pool: Pool,
    insert_sql: String,
    select_sql: String,
}

impl SqlOutcomeStore {
    /// Wrap a pool whose schema was prepared with `ensure_step_outcomes_table`
    pub fn new(pool: Pool) -> Self {
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            STEP_OUTCOMES_TABLE,
            column_list()
        );
        let select_sql = format!(
            "SELECT {} FROM {} WHERE chain_id = $1 ORDER BY step_number",
            column_list(),
            STEP_OUTCOMES_TABLE
        );
        Self {
            insert_sql: pool.dialect(&insert_sql).into_owned(),
            select_sql: pool.dialect(&select_sql).into_owned(),
            pool,
        }
    }

    fn map_insert_error(outcome: &StepOutcome, err: sqlx::Error) -> StoreError {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::DuplicateStep {
                    chain_id: outcome.chain_id.clone(),
                    step_number: outcome.step_number,
                }
            }
            _ => StoreError::Database(err),
        }
    }
}

fn row_to_outcome(row: OutcomeRow) -> Result<StepOutcome, StoreError> {
    let (
        task_id,
        chain_id,
        step_number,
        prompt,
        response,
        status,
        error_message,
        created_at,
        completed_at,
        execution_time_ms,
    ) = row;

    let status = StepStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{status}' for task {task_id}")))?;
    let step_number = u32::try_from(step_number)
        .map_err(|_| StoreError::Corrupt(format!("step number {step_number} out of range")))?;
    let execution_time_ms = u64::try_from(execution_time_ms).map_err(|_| {
        StoreError::Corrupt(format!("negative execution time for task {task_id}"))
    })?;

    Ok(StepOutcome {
        task_id,
        chain_id,
        step_number,
        prompt,
        response,
        status,
        error_message,
        created_at,
        completed_at,
        execution_time_ms,
    })
}

#[async_trait]
impl OutcomeStore for SqlOutcomeStore {
    async fn append_step_outcome(&self, outcome: &StepOutcome) -> Result<(), StoreError> {
        let execution_time_ms = i64::try_from(outcome.execution_time_ms)
            .map_err(|_| StoreError::Corrupt("execution time overflows BIGINT".to_string()))?;

        let result = match &self.pool.inner {
            PoolInner::Postgres(pool) => sqlx::query(&self.insert_sql)
                .bind(&outcome.task_id)
                .bind(&outcome.chain_id)
                .bind(i64::from(outcome.step_number))
                .bind(&outcome.prompt)
                .bind(outcome.response.as_deref())
                .bind(outcome.status.as_str())
                .bind(outcome.error_message.as_deref())
                .bind(outcome.created_at)
                .bind(outcome.completed_at)
                .bind(execution_time_ms)
                .execute(pool)
                .await
                .map(|_| ()),
            PoolInner::Sqlite(pool) => sqlx::query(&self.insert_sql)
                .bind(&outcome.task_id)
                .bind(&outcome.chain_id)
                .bind(i64::from(outcome.step_number))
                .bind(&outcome.prompt)
                .bind(outcome.response.as_deref())
                .bind(outcome.status.as_str())
                .bind(outcome.error_message.as_deref())
                .bind(outcome.created_at)
                .bind(outcome.completed_at)
                .bind(execution_time_ms)
                .execute(pool)
                .await
                .map(|_| ()),
        };

        result.map_err(|err| Self::map_insert_error(outcome, err))
    }

    async fn list_chain(&self, chain_id: &str) -> Result<Vec<StepOutcome>, StoreError> {
        let rows: Vec<OutcomeRow> = match &self.pool.inner {
            PoolInner::Postgres(pool) => {
                sqlx::query_as(&self.select_sql)
                    .bind(chain_id)
                    .fetch_all(pool)
                    .await?
            }
            PoolInner::Sqlite(pool) => {
                sqlx::query_as(&self.select_sql)
                    .bind(chain_id)
                    .fetch_all(pool)
                    .await?
            }
        };

        rows.into_iter().map(row_to_outcome).collect()
    }
}
