//! Per-database table allow-list and the authorizer that enforces it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use super::structural::TableRef;
use super::verdict::RejectionReason;
use crate::config::DatabaseConfig;

/// Verbs a table may be opened for. Anything else in configuration is an error.
pub const READ_OPERATIONS: &[&str] = &["SELECT", "WITH"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllowListError {
    #[error("database '{database}' lists a table with an empty name")]
    EmptyTableName { database: String },
    #[error("table '{database}.{table}' allows non read-only operation '{operation}'")]
    NonReadOnlyOperation {
        database: String,
        table: String,
        operation: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TablePolicy {
    pub name: String,
    pub description: String,
    pub allowed_operations: BTreeSet<String>,
    pub row_limit: Option<usize>,
}

impl TablePolicy {
    /// A table that may only be read with `SELECT`.
    pub fn read_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            allowed_operations: BTreeSet::from(["SELECT".to_string()]),
            row_limit: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }

    pub fn allows(&self, operation: &str) -> bool {
        self.allowed_operations
            .contains(&operation.to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabasePolicy {
    pub name: String,
    pub description: String,
    /// Keyed by lower-cased table name.
    pub tables: BTreeMap<String, TablePolicy>,
}

impl DatabasePolicy {
    pub fn table(&self, name: &str) -> Option<&TablePolicy> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.values().map(|t| t.name.as_str()).collect()
    }
}

/// Immutable mapping from database name to the tables that may be read.
///
/// Built once at startup and shared behind an `Arc`; tests build their own
/// with [`TableAllowList::with_table`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableAllowList {
    databases: BTreeMap<String, DatabasePolicy>,
}

impl TableAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(
        databases: &HashMap<String, DatabaseConfig>,
    ) -> Result<Self, AllowListError> {
        let mut list = Self::new();
        for (db_name, db_config) in databases {
            let policy = list.database_entry(db_name);
            policy.description = db_config.description.clone();

            for table in &db_config.tables {
                if table.name.trim().is_empty() {
                    return Err(AllowListError::EmptyTableName {
                        database: db_name.clone(),
                    });
                }

                let mut operations = BTreeSet::new();
                for operation in &table.allowed_operations {
                    let operation = operation.trim().to_ascii_uppercase();
                    if !READ_OPERATIONS.contains(&operation.as_str()) {
                        return Err(AllowListError::NonReadOnlyOperation {
                            database: db_name.clone(),
                            table: table.name.clone(),
                            operation,
                        });
                    }
                    operations.insert(operation);
                }

                policy.tables.insert(
                    table.name.to_lowercase(),
                    TablePolicy {
                        name: table.name.clone(),
                        description: table.description.clone(),
                        allowed_operations: operations,
                        row_limit: table.row_limit,
                    },
                );
            }
        }
        Ok(list)
    }

    /// Builder used by tests and embedders.
    pub fn with_table(mut self, database: &str, table: TablePolicy) -> Self {
        self.database_entry(database)
            .tables
            .insert(table.name.to_lowercase(), table);
        self
    }

    fn database_entry(&mut self, database: &str) -> &mut DatabasePolicy {
        self.databases
            .entry(database.to_lowercase())
            .or_insert_with(|| DatabasePolicy {
                name: database.to_string(),
                description: String::new(),
                tables: BTreeMap::new(),
            })
    }

    pub fn database(&self, name: &str) -> Option<&DatabasePolicy> {
        self.databases.get(&name.to_lowercase())
    }

    pub fn databases(&self) -> impl Iterator<Item = &DatabasePolicy> {
        self.databases.values()
    }

    /// Checks every referenced table against `database`'s allow-list and
    /// returns the canonical names of the tables read.
    ///
    /// A qualified reference is accepted only when its qualifier names the
    /// target database itself.
    pub fn authorize(
        &self,
        database: &str,
        tables: &[TableRef],
    ) -> Result<Vec<String>, RejectionReason> {
        let policy = self.database(database);
        let mut authorized: Vec<String> = Vec::new();

        for table in tables {
            if let Some(qualifier) = table.qualifier() {
                if !qualifier.eq_ignore_ascii_case(database) {
                    return Err(RejectionReason::UnauthorizedTable(table.to_string()));
                }
            }

            let allowed = policy
                .and_then(|p| p.table(table.name()))
                .filter(|t| t.allows("SELECT"));

            match allowed {
                Some(t) => {
                    if !authorized.contains(&t.name) {
                        authorized.push(t.name.clone());
                    }
                }
                None => return Err(RejectionReason::UnauthorizedTable(table.to_string())),
            }
        }

        Ok(authorized)
    }
}

static FROM_OR_JOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+((?:"[^"]+"|[A-Za-z_][A-Za-z0-9_]*)(?:\s*\.\s*(?:"[^"]+"|[A-Za-z_][A-Za-z0-9_]*))*)"#)
        .expect("table pattern compiles")
});

static CTE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bWITH|,)\s*(?:RECURSIVE\s+)?([A-Za-z_][A-Za-z0-9_]*)\s+AS\s*\(")
        .expect("cte pattern compiles")
});

/// Textual table scan used only when no structural parser is configured.
/// Misses tables hidden behind unusual quoting or comma joins.
pub fn scan_tables(sql: &str) -> Vec<TableRef> {
    let cte_names: HashSet<String> = CTE_NAME
        .captures_iter(sql)
        .map(|c| c[1].to_lowercase())
        .collect();

    let mut tables: Vec<TableRef> = Vec::new();
    for capture in FROM_OR_JOIN.captures_iter(sql) {
        let parts: Vec<String> = capture[1]
            .split('.')
            .map(|p| p.trim().trim_matches('"').to_string())
            .collect();
        let table = TableRef::new(parts);
        if table.qualifier().is_none() && cte_names.contains(&table.name().to_lowercase()) {
            continue;
        }
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    tables
}
