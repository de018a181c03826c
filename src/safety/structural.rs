//! AST-level validation.
//!
//! Parses SQL with `sqlparser`, requires a single read-only query at the
//! root, and walks every nested query, CTE and set operation looking for
//! statements that would modify state. The walk also collects the relations
//! the query reads so the table authorizer works from the parse tree rather
//! than from text. Table functions (`read_csv(...)`, `LATERAL fn(...)`,
//! `TABLE(fn(...))`) are collected under the function name, so they only pass
//! authorization if that name is allow-listed.

use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, ObjectName, ObjectNamePart, Query, SetExpr, Statement, TableFactor, Visit, Visitor,
};
use sqlparser::dialect::{Dialect, GenericDialect, dialect_from_str};
use sqlparser::parser::Parser;

use super::verdict::RejectionReason;

/// A table reference as written in the query, split on dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    parts: Vec<String>,
}

impl TableRef {
    pub fn new(parts: Vec<String>) -> Self {
        Self { parts }
    }

    /// Unqualified table name.
    pub fn name(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }

    /// The part right before the table name (schema or database), if any.
    pub fn qualifier(&self) -> Option<&str> {
        match self.parts.len() {
            0 | 1 => None,
            n => Some(self.parts[n - 2].as_str()),
        }
    }

    fn from_object_name(name: &ObjectName) -> Self {
        Self::new(name.0.iter().map(part_value).collect())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join("."))
    }
}

fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        _ => String::new(),
    }
}

/// What the structural pass learned about an accepted query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuralReport {
    /// Relations read by the query, CTE names excluded.
    pub tables: Vec<TableRef>,
}

/// Structural SQL parser collaborator.
pub trait StructuralParser: Send + Sync {
    /// Dialect name the parser was built for.
    fn dialect(&self) -> &str;

    /// Parse and check `sql`. Parse failures come back as
    /// [`RejectionReason::SyntaxError`].
    fn analyze(&self, sql: &str) -> Result<StructuralReport, RejectionReason>;
}

/// [`StructuralParser`] backed by `sqlparser`.
#[derive(Debug, Clone)]
pub struct SqlParserAnalyzer {
    dialect: String,
}

impl SqlParserAnalyzer {
    /// Returns `None` when `sqlparser` does not know the dialect.
    pub fn new(dialect: &str) -> Option<Self> {
        dialect_from_str(dialect).map(|_| Self {
            dialect: dialect.to_lowercase(),
        })
    }
}

impl StructuralParser for SqlParserAnalyzer {
    fn dialect(&self) -> &str {
        &self.dialect
    }

    fn analyze(&self, sql: &str) -> Result<StructuralReport, RejectionReason> {
        let dialect = dialect_from_str(&self.dialect)
            .unwrap_or_else(|| Box::new(GenericDialect {}) as Box<dyn Dialect>);
        let statements = Parser::parse_sql(dialect.as_ref(), sql)
            .map_err(|e| RejectionReason::SyntaxError(e.to_string()))?;

        let statement = match statements.as_slice() {
            [single] => single,
            [] => {
                return Err(RejectionReason::MissingQueryForm(
                    "no statement found".to_string(),
                ));
            }
            many => {
                return Err(RejectionReason::ForbiddenOperation(format!(
                    "expected a single statement, found {}",
                    many.len()
                )));
            }
        };

        if !matches!(statement, Statement::Query(_)) {
            return Err(RejectionReason::MissingQueryForm(format!(
                "non-SELECT top-level statement: {}",
                statement_keyword(statement)
            )));
        }

        let mut walker = TreeWalker::default();
        if let ControlFlow::Break(reason) = statement.visit(&mut walker) {
            return Err(reason);
        }
        Ok(walker.into_report())
    }
}

/// Leading keyword of a statement, e.g. `DELETE` or `CREATE`.
fn statement_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

/// Target of a `SELECT ... INTO`, searched through set operations.
fn select_into_target(body: &SetExpr) -> Option<String> {
    match body {
        SetExpr::Select(select) => select.into.as_ref().map(|into| into.name.to_string()),
        SetExpr::SetOperation { left, right, .. } => {
            select_into_target(left).or_else(|| select_into_target(right))
        }
        _ => None,
    }
}

#[derive(Default)]
struct TreeWalker {
    seen_root: bool,
    relations: Vec<TableRef>,
    cte_names: HashSet<String>,
}

impl TreeWalker {
    fn into_report(self) -> StructuralReport {
        let mut seen = HashSet::new();
        let tables = self
            .relations
            .into_iter()
            .filter(|table| {
                !(table.qualifier().is_none()
                    && self.cte_names.contains(&table.name().to_lowercase()))
            })
            .filter(|table| seen.insert(table.clone()))
            .collect();
        StructuralReport { tables }
    }
}

impl Visitor for TreeWalker {
    type Break = RejectionReason;

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        // the root query is the only statement allowed in the tree
        if !self.seen_root {
            self.seen_root = true;
            return ControlFlow::Continue(());
        }
        ControlFlow::Break(RejectionReason::ForbiddenOperation(format!(
            "nested {} statement",
            statement_keyword(statement)
        )))
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        if let Some(target) = select_into_target(&query.body) {
            return ControlFlow::Break(RejectionReason::ForbiddenOperation(format!(
                "SELECT INTO {target}"
            )));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.push(TableRef::from_object_name(relation));
        ControlFlow::Continue(())
    }

    // `TableFactor::Table` names arrive through `pre_visit_relation`; these
    // forms name what they read some other way.
    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match factor {
            TableFactor::Function { name, .. } | TableFactor::SemanticView { name, .. } => {
                self.relations.push(TableRef::from_object_name(name));
            }
            TableFactor::TableFunction { expr, .. } => match expr {
                Expr::Function(function) => {
                    self.relations.push(TableRef::from_object_name(&function.name));
                }
                other => {
                    return ControlFlow::Break(RejectionReason::ForbiddenOperation(format!(
                        "TABLE({other}) is not a table function call"
                    )));
                }
            },
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
