use crate::db::executor::{DuckDbPool, QueryExecutor};
use crate::safety::{DatabasePolicy, TableAllowList};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub description: String,
    /// Empty when the database could not be introspected.
    pub columns: Vec<ColumnInfo>,
}

/// Caches the columns of allow-listed tables and renders them as prompt
/// context. Tables outside the allow-list are never shown to the model.
pub struct SchemaManager {
    allow_list: Arc<TableAllowList>,
    /// database name (lower-cased) -> introspected columns per table
    schema_cache: RwLock<HashMap<String, HashMap<String, Vec<ColumnInfo>>>>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
}

impl SchemaManager {
    pub fn new(allow_list: Arc<TableAllowList>) -> Self {
        Self {
            allow_list,
            schema_cache: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
        }
    }

    /// Re-reads `information_schema.columns` of every database with a pool.
    /// A database that fails keeps its previous cache entry.
    pub async fn refresh_cache(&self, executor: &QueryExecutor) {
        info!("Refreshing schema cache");

        for policy in self.allow_list.databases() {
            let Some(pool) = executor.pool(&policy.name).cloned() else {
                debug!("No pool for database '{}', using configured descriptions", policy.name);
                continue;
            };

            let result = tokio::task::spawn_blocking(move || introspect(&pool)).await;
            match result {
                Ok(Ok(columns)) => {
                    let allowed: HashMap<String, Vec<ColumnInfo>> = columns
                        .into_iter()
                        .filter(|(table, _)| policy.table(table).is_some())
                        .collect();
                    info!("Found {} allow-listed tables in {}", allowed.len(), policy.name);
                    self.schema_cache
                        .write()
                        .await
                        .insert(policy.name.to_lowercase(), allowed);
                }
                Ok(Err(e)) => warn!("Failed to introspect {}: {}", policy.name, e),
                Err(e) => warn!("Schema task for {} failed: {}", policy.name, e),
            }
        }

        *self.last_refresh.write().await = Some(Utc::now());
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.read().await
    }

    /// Allow-listed tables of `database` with whatever columns are known.
    pub async fn tables_for(&self, database: &str) -> Vec<TableSchema> {
        let Some(policy) = self.allow_list.database(database) else {
            return Vec::new();
        };
        let cache = self.schema_cache.read().await;
        let known = cache.get(&policy.name.to_lowercase());
        tables_with_columns(policy, known)
    }

    /// Schema description handed to the model for generation and repair.
    pub async fn context_for(&self, database: &str) -> String {
        render_context(&self.tables_for(database).await)
    }
}

fn tables_with_columns(
    policy: &DatabasePolicy,
    known: Option<&HashMap<String, Vec<ColumnInfo>>>,
) -> Vec<TableSchema> {
    policy
        .tables
        .iter()
        .map(|(key, table)| TableSchema {
            name: table.name.clone(),
            description: table.description.clone(),
            columns: known
                .and_then(|k| k.get(key))
                .cloned()
                .unwrap_or_default(),
        })
        .collect()
}

pub fn render_context(tables: &[TableSchema]) -> String {
    let mut context = String::new();
    for table in tables {
        context.push_str(&format!("Table: {}\n", table.name));
        if !table.description.is_empty() {
            context.push_str(&format!("Description: {}\n", table.description));
        }
        if table.columns.is_empty() {
            context.push_str("Columns: (not available)\n");
        } else {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("{}({})", c.name, c.data_type))
                .collect();
            context.push_str(&format!("Columns: {}\n", columns.join(", ")));
        }
        context.push('\n');
    }
    context
}

/// Columns per lower-cased table name.
fn introspect(pool: &DuckDbPool) -> Result<HashMap<String, Vec<ColumnInfo>>, crate::db::executor::ExecutionError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT table_name, column_name, data_type FROM information_schema.columns \
         WHERE table_schema = 'main' ORDER BY table_name, ordinal_position",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            ColumnInfo {
                name: row.get(1)?,
                data_type: row.get(2)?,
            },
        ))
    })?;

    let mut tables: HashMap<String, Vec<ColumnInfo>> = HashMap::new();
    for row in rows {
        let (table, column) = row?;
        tables.entry(table.to_lowercase()).or_default().push(column);
    }
    Ok(tables)
}
