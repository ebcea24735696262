//! Connection pool over the supported sqlx backends.
use std::borrow::Cow;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::config::CONNECT_TIMEOUT;

/// Inner pool variants
#[derive(Debug, Clone)]
pub(crate) enum PoolInner {
    Postgres(sqlx::PgPool),
    Sqlite(sqlx::SqlitePool),
}

// Wrap pool implementations so callers can hold one type regardless of backend.
#[derive(Debug, Clone)]
pub struct Pool {
    pub(crate) inner: PoolInner,
}

/// Open a pool for a `postgres://` or `sqlite:` URL
pub async fn connect(database_url: &str, max_connections: u32) -> Result<Pool> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        return Ok(Pool {
            inner: PoolInner::Postgres(pool),
        });
    }

    if database_url.starts_with("sqlite:") {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid SQLite URL")?
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;
        return Ok(Pool {
            inner: PoolInner::Sqlite(pool),
        });
    }

    Err(anyhow!(
        "Unsupported database URL '{}'. Expected postgres://... or sqlite:...",
        database_url
    ))
}

impl Pool {
    /// Create an in-memory SQLite pool
    ///
    /// Every SQLite connection to `:memory:` is a separate database, so the
    /// pool is pinned to a single long-lived connection.
    pub async fn sqlite_in_memory() -> Result<Self, sqlx::Error> {
        let sqlite_pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Pool {
            inner: PoolInner::Sqlite(sqlite_pool),
        })
    }

    /// Execute a statement without binds (for DDL like CREATE TABLE)
    pub async fn execute_query(&self, sql: &str) -> Result<(), sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                sqlx::query(sql).execute(pool).await?;
            }
            PoolInner::Sqlite(pool) => {
                sqlx::query(sql).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Check if this pool is using PostgreSQL (returns false for SQLite)
    pub fn is_postgres(&self) -> bool {
        matches!(&self.inner, PoolInner::Postgres(_))
    }

    /// Rewrite Postgres-style SQL for the pool's backend
    pub fn dialect<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        if self.is_postgres() {
            Cow::Borrowed(sql)
        } else {
            Cow::Owned(convert_to_sqlite_placeholders(sql))
        }
    }
}

/// Convert Postgres-style placeholders ($1, $2, ...) to SQLite-style (?, ?, ...)
///
/// Placeholders must appear in ascending order, since `?` binds positionally.
fn convert_to_sqlite_placeholders(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            // Skip the dollar sign and any following digits
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            result.push('?');
        } else {
            result.push(ch);
        }
    }

    result
}
