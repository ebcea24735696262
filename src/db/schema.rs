use anyhow::{Context, Result};
use tracing::info;

use super::pool::Pool;
use crate::config::STEP_OUTCOMES_TABLE;

/// Column definition for the step outcome table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Column {
    name: &'static str,
    postgres_type: &'static str,
    sqlite_type: &'static str,
    nullable: bool,
}

const COLUMNS: &[Column] = &[
    Column {
        name: "task_id",
        postgres_type: "TEXT",
        sqlite_type: "TEXT",
        nullable: false,
    },
    Column {
        name: "chain_id",
        postgres_type: "TEXT",
        sqlite_type: "TEXT",
        nullable: false,
    },
    Column {
        name: "step_number",
        postgres_type: "BIGINT",
        sqlite_type: "INTEGER",
        nullable: false,
    },
    Column {
        name: "prompt",
        postgres_type: "TEXT",
        sqlite_type: "TEXT",
        nullable: false,
    },
    Column {
        name: "response",
        postgres_type: "TEXT",
        sqlite_type: "TEXT",
        nullable: true,
    },
    Column {
        name: "status",
        postgres_type: "TEXT",
        sqlite_type: "TEXT",
        nullable: false,
    },
    Column {
        name: "error_message",
        postgres_type: "TEXT",
        sqlite_type: "TEXT",
        nullable: true,
    },
    Column {
        name: "created_at",
        postgres_type: "TIMESTAMP WITH TIME ZONE",
        sqlite_type: "TEXT",
        nullable: false,
    },
    Column {
        name: "completed_at",
        postgres_type: "TIMESTAMP WITH TIME ZONE",
        sqlite_type: "TEXT",
        nullable: false,
    },
    Column {
        name: "execution_time_ms",
        postgres_type: "BIGINT",
        sqlite_type: "INTEGER",
        nullable: false,
    },
];

/// Comma separated column list in table order
pub fn column_list() -> String {
    COLUMNS
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Generate the CREATE TABLE statement for the given backend
pub fn generate_ddl(postgres: bool) -> String {
    let columns: Vec<String> = COLUMNS
        .iter()
        .map(|c| {
            let sql_type = if postgres {
                c.postgres_type
            } else {
                c.sqlite_type
            };
            if c.nullable {
                format!("    {} {}", c.name, sql_type)
            } else {
                format!("    {} {} NOT NULL", c.name, sql_type)
            }
        })
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{},\n    PRIMARY KEY (task_id),\n    \
         CHECK (status IN ('success', 'error')),\n    \
         CHECK (execution_time_ms >= 0)\n)",
        STEP_OUTCOMES_TABLE,
        columns.join(",\n")
    )
}

/// Unique index enforcing one record per `(chain_id, step_number)`
pub fn generate_unique_index() -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {table}_chain_step_idx ON {table} (chain_id, step_number)",
        table = STEP_OUTCOMES_TABLE
    )
}

/// Create the step outcome table and its unique index if they don't exist
pub async fn ensure_step_outcomes_table(pool: &Pool) -> Result<()> {
    info!("Ensuring table {} exists", STEP_OUTCOMES_TABLE);

    pool.execute_query(&generate_ddl(pool.is_postgres()))
        .await
        .context("Failed to create step outcome table")?;

    pool.execute_query(&generate_unique_index())
        .await
        .context("Failed to create step outcome index")?;

    Ok(())
}
