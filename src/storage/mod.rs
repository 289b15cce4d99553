//! SQLite storage layer -- pool, schema, and typed queries per record kind.
//!
//! All queries are short synchronous statements; no connection is held
//! across an `.await`.

pub mod catalog;
pub mod confirmations;
pub mod executions;
pub mod logs;
pub mod runs;
pub mod schema;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA temp_store = MEMORY;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(PRAGMAS));
    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Single-connection in-memory database. The connection is never recycled,
/// so the data lives as long as the pool.
pub fn open_in_memory() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = R2D2Pool::builder()
        .max_size(1)
        .max_lifetime(None)
        .idle_timeout(None)
        .build(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;
    drop(conn);

    Ok(pool)
}

/// Typed access to the engine's tables.
///
/// Query methods are split across the submodules (`runs`, `executions`,
/// `confirmations`, `logs`, `catalog`), one `impl Store` block each.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(open_in_memory()?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("failed to get database connection")
    }
}

/// Fixed-width UTC timestamps so that text comparison in SQL is chronological.
pub(crate) fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_time(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_time(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_time(idx, s)).transpose()
}

pub(crate) fn parse_text<T>(idx: usize, s: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

pub(crate) fn parse_json<T>(idx: usize, s: String) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
