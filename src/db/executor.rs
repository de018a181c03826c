//! Runs approved queries against the configured DuckDB databases.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use r2d2::Pool;
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{AppConfig, DatabaseConfig};
use crate::db::db_pool::DuckDBConnectionManager;
use crate::safety::{ApprovedQuery, TableAllowList};

pub type DuckDbPool = Pool<DuckDBConnectionManager>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("no connection pool for database '{0}'")]
    UnknownDatabase(String),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),
    #[error("failed to serialize Arrow data: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result of one executed query, serialized as an Arrow IPC file.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub sql: String,
    pub arrow_ipc: Vec<u8>,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub row_limit: usize,
    pub execution_time_ms: u64,
}

pub struct QueryExecutor {
    pools: HashMap<String, DuckDbPool>,
    allow_list: Arc<TableAllowList>,
    max_result_rows: usize,
}

impl QueryExecutor {
    pub fn new(allow_list: Arc<TableAllowList>, max_result_rows: usize) -> Self {
        Self {
            pools: HashMap::new(),
            allow_list,
            max_result_rows,
        }
    }

    /// Opens a pool per configured database. Databases that fail to open are
    /// logged and left out; queries against them fail with
    /// [`ExecutionError::UnknownDatabase`].
    pub fn from_config(config: &AppConfig, allow_list: Arc<TableAllowList>) -> Self {
        let mut executor = Self::new(allow_list, config.safety.max_result_rows);
        for (name, db_config) in &config.databases {
            if let Err(e) = executor.add_database(name, db_config) {
                error!("Failed to open database '{}' at {}: {}", name, db_config.connection_string, e);
            }
        }
        executor
    }

    pub fn add_database(&mut self, name: &str, config: &DatabaseConfig) -> Result<(), ExecutionError> {
        let manager = DuckDBConnectionManager::open(&config.connection_string, config.read_only)?;
        info!(
            "Opened database '{}' ({}{})",
            name,
            manager.connection_string(),
            if manager.is_read_only() { ", read-only" } else { "" }
        );
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .build(manager)?;
        self.pools.insert(name.to_lowercase(), pool);
        Ok(())
    }

    pub fn pool(&self, database: &str) -> Option<&DuckDbPool> {
        self.pools.get(&database.to_lowercase())
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.pool(database).is_some()
    }

    /// Smallest of the global result cap and the row limits of every table
    /// the query reads.
    pub fn row_limit_for(&self, query: &ApprovedQuery) -> usize {
        let Some(policy) = self.allow_list.database(query.database()) else {
            return self.max_result_rows;
        };
        query
            .verdict()
            .tables()
            .iter()
            .filter_map(|table| policy.table(table).and_then(|t| t.row_limit))
            .fold(self.max_result_rows, usize::min)
    }

    pub async fn execute(&self, query: &ApprovedQuery) -> Result<QueryOutput, ExecutionError> {
        let pool = self
            .pool(query.database())
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownDatabase(query.database().to_string()))?;

        let row_limit = self.row_limit_for(query);
        let sql = limit_rows(query.sql(), row_limit);
        debug!("Executing on {}: {}", query.database(), sql);

        let started = Instant::now();
        let task_sql = sql.clone();
        let (arrow_ipc, columns, row_count) =
            tokio::task::spawn_blocking(move || run_arrow_query(&pool, &task_sql)).await??;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        info!(
            "Query on {} returned {} row(s) in {} ms",
            query.database(),
            row_count,
            execution_time_ms
        );

        Ok(QueryOutput {
            sql,
            arrow_ipc,
            columns,
            row_count,
            row_limit,
            execution_time_ms,
        })
    }
}

/// Wraps a query so it returns at most `limit` rows.
///
/// A query that parses is re-rendered from its AST, which drops comments and
/// the trailing semicolon. Anything else is wrapped as written, on its own
/// lines so a trailing `--` comment cannot swallow the wrapper.
pub fn limit_rows(sql: &str, limit: usize) -> String {
    let inner = match Parser::parse_sql(&DuckDbDialect {}, sql).as_deref() {
        Ok([statement]) => statement.to_string(),
        _ => {
            let sql = sql.trim();
            sql.strip_suffix(';').unwrap_or(sql).trim_end().to_string()
        }
    };
    format!("SELECT * FROM (\n{inner}\n) AS _limited LIMIT {limit}")
}

fn run_arrow_query(
    pool: &DuckDbPool,
    sql: &str,
) -> Result<(Vec<u8>, Vec<String>, usize), ExecutionError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(sql)?;
    let results = stmt.query_arrow([])?;
    let schema = results.get_schema();

    let columns = schema
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect::<Vec<String>>();

    let batches: Vec<_> = results.collect();
    let row_count = batches.iter().map(|batch| batch.num_rows()).sum();

    let mut buffer = Vec::new();
    {
        let mut writer = arrow::ipc::writer::FileWriter::try_new(&mut buffer, schema.deref())?;
        for batch in &batches {
            writer.write(batch)?;
        }
        writer.finish()?;
    }

    Ok((buffer, columns, row_count))
}
