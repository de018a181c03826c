//! SQL safety gate.
//!
//! Every SQL statement passes through [`SafetyGate::validate`] before it may
//! run: keyword screen, structural check, then table authorization. Only a
//! valid verdict produces an [`ApprovedQuery`], and the executor accepts
//! nothing else.

pub mod keywords;
pub mod structural;
pub mod tables;
pub mod verdict;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SafetyConfig;
pub use structural::{SqlParserAnalyzer, StructuralParser, StructuralReport, TableRef};
pub use tables::{AllowListError, DatabasePolicy, TableAllowList, TablePolicy};
pub use verdict::{ApprovedQuery, Origin, QueryCandidate, Rejected, RejectionReason, Verdict};

/// Matches the original deployment's security rules.
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 10_000;

pub struct SafetyGate {
    allow_list: Arc<TableAllowList>,
    parser: Option<Box<dyn StructuralParser>>,
    max_query_length: usize,
}

impl SafetyGate {
    pub fn new(allow_list: Arc<TableAllowList>, parser: Box<dyn StructuralParser>) -> Self {
        Self {
            allow_list,
            parser: Some(parser),
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
        }
    }

    /// Gate without a structural parser. Nested mutations that slip past the
    /// keyword screen are not detected and table names come from a text scan.
    pub fn keyword_only(allow_list: Arc<TableAllowList>) -> Self {
        warn!("SQL safety gate running without a structural parser, keyword checks only");
        Self {
            allow_list,
            parser: None,
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
        }
    }

    /// Builds the gate described by the `[safety]` config section. An unknown
    /// dialect degrades to keyword-only validation rather than failing.
    pub fn from_config(config: &SafetyConfig, allow_list: Arc<TableAllowList>) -> Self {
        let gate = if !config.structural_check {
            Self::keyword_only(allow_list)
        } else {
            match SqlParserAnalyzer::new(&config.dialect) {
                Some(parser) => Self::new(allow_list, Box::new(parser)),
                None => {
                    warn!("Unknown SQL dialect '{}'", config.dialect);
                    Self::keyword_only(allow_list)
                }
            }
        };
        gate.with_max_query_length(config.max_query_length)
    }

    pub fn with_max_query_length(mut self, max_query_length: usize) -> Self {
        self.max_query_length = max_query_length;
        self
    }

    pub fn allow_list(&self) -> &TableAllowList {
        &self.allow_list
    }

    pub fn structural_enabled(&self) -> bool {
        self.parser.is_some()
    }

    /// Validates `sql` for `database`. Pure apart from logging: the same
    /// input always yields the same verdict.
    pub fn validate(&self, sql: &str, database: &str) -> Verdict {
        let structural_checked = self.structural_enabled();
        match self.run_checks(sql, database) {
            Ok(tables) => {
                debug!("SQL accepted for {}: {}", database, sql);
                Verdict::accept(tables, structural_checked)
            }
            Err(reason) => {
                log_rejection(database, sql, &reason);
                let suggestions = self.suggestions_for(&reason, database);
                Verdict::reject(reason, suggestions, structural_checked)
            }
        }
    }

    pub fn check(&self, candidate: &QueryCandidate) -> Verdict {
        self.validate(candidate.sql(), candidate.database())
    }

    /// Validates the candidate and hands it back either approved for
    /// execution or paired with its rejection.
    pub fn approve(&self, candidate: QueryCandidate) -> Result<ApprovedQuery, Rejected> {
        let verdict = self.check(&candidate);
        if verdict.is_valid() {
            Ok(ApprovedQuery::new(candidate, verdict))
        } else {
            Err(Rejected { candidate, verdict })
        }
    }

    fn run_checks(&self, sql: &str, database: &str) -> Result<Vec<String>, RejectionReason> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(RejectionReason::MissingQueryForm("empty query".to_string()));
        }
        if trimmed.chars().count() > self.max_query_length {
            return Err(RejectionReason::QueryTooLong {
                length: trimmed.chars().count(),
                limit: self.max_query_length,
            });
        }

        keywords::classify(trimmed)?;

        let referenced = match &self.parser {
            Some(parser) => parser.analyze(trimmed)?.tables,
            None => tables::scan_tables(trimmed),
        };

        self.allow_list.authorize(database, &referenced)
    }

    fn suggestions_for(&self, reason: &RejectionReason, database: &str) -> Vec<String> {
        match reason {
            RejectionReason::SyntaxError(_) => vec![
                "Check keyword spelling, parentheses and quoting".to_string(),
            ],
            RejectionReason::ForbiddenKeyword(keyword) => vec![
                format!("Remove {keyword}; only read-only SELECT queries are allowed"),
                "Avoid forbidden words in comments and string literals".to_string(),
            ],
            RejectionReason::MissingQueryForm(_) => {
                vec!["Write a single SELECT (optionally WITH ... SELECT) query".to_string()]
            }
            RejectionReason::ForbiddenOperation(_) => vec![
                "Use plain SELECT subqueries; no data-modifying CTEs or SELECT INTO".to_string(),
            ],
            RejectionReason::UnauthorizedTable(_) => match self.allow_list.database(database) {
                Some(policy) if !policy.tables.is_empty() => vec![format!(
                    "Use only these tables: {}",
                    policy.table_names().join(", ")
                )],
                _ => vec![format!("No tables are allow-listed for database '{database}'")],
            },
            RejectionReason::QueryTooLong { limit, .. } => {
                vec![format!("Shorten the query to at most {limit} characters")]
            }
            RejectionReason::RepairExhausted { .. } => Vec::new(),
        }
    }
}

/// Malformed SQL and unsafe SQL go to separate log targets so operators can
/// tell bad model output from adversarial input.
fn log_rejection(database: &str, sql: &str, reason: &RejectionReason) {
    if reason.is_security() {
        warn!(target: "nl_sqlgate::security", database, code = reason.code(), "Rejected SQL: {} ({})", sql, reason);
    } else {
        warn!(target: "nl_sqlgate::syntax", database, code = reason.code(), "Unparseable SQL: {} ({})", sql, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_list() -> Arc<TableAllowList> {
        Arc::new(
            TableAllowList::new()
                .with_table("douyin_analytics", TablePolicy::read_only("douyin_products"))
                .with_table("douyin_analytics", TablePolicy::read_only("sales_summary"))
                .with_table("douyin_analytics", TablePolicy::read_only("product_trends"))
                .with_table("douyin_analytics", TablePolicy::read_only("category_analysis")),
        )
    }

    fn gate() -> SafetyGate {
        SafetyGate::new(
            allow_list(),
            Box::new(SqlParserAnalyzer::new("duckdb").unwrap()),
        )
    }

    #[test]
    fn test_reference_examples() {
        let gate = gate();

        let ok = gate.validate("SELECT * FROM douyin_products LIMIT 10", "douyin_analytics");
        assert!(ok.is_valid());
        assert_eq!(ok.tables(), ["douyin_products"]);
        assert!(ok.structural_checked());

        let drop = gate.validate("DROP TABLE douyin_products", "douyin_analytics");
        assert!(!drop.is_valid());
        assert_eq!(
            drop.reason(),
            Some(&RejectionReason::ForbiddenKeyword("DROP".into()))
        );

        let unknown = gate.validate("SELECT * FROM unauthorized_table", "douyin_analytics");
        assert_eq!(
            unknown.reason(),
            Some(&RejectionReason::UnauthorizedTable("unauthorized_table".into()))
        );
        assert!(unknown.suggestions()[0].contains("douyin_products"));
    }

    #[test]
    fn test_forbidden_keyword_regardless_of_case_and_whitespace() {
        let gate = gate();
        for sql in [
            "delete from douyin_products",
            "\n\n   DeLeTe   FROM douyin_products   ",
            "SELECT * FROM douyin_products; drop table sales_summary",
            "SELECT * FROM (DELETE FROM douyin_products RETURNING *) d",
        ] {
            let verdict = gate.validate(sql, "douyin_analytics");
            assert!(
                matches!(verdict.reason(), Some(RejectionReason::ForbiddenKeyword(_))),
                "{sql:?} gave {verdict:?}"
            );
        }
    }

    #[test]
    fn test_structural_check_catches_select_into() {
        let verdict = gate().validate(
            "SELECT * INTO product_copy FROM douyin_products",
            "douyin_analytics",
        );
        assert!(matches!(
            verdict.reason(),
            Some(RejectionReason::ForbiddenOperation(_))
        ));
    }

    #[test]
    fn test_unauthorized_table_in_subquery() {
        let verdict = gate().validate(
            "SELECT * FROM douyin_products WHERE id IN (SELECT product_id FROM secret_orders)",
            "douyin_analytics",
        );
        assert_eq!(
            verdict.reason(),
            Some(&RejectionReason::UnauthorizedTable("secret_orders".into()))
        );
    }

    #[test]
    fn test_table_functions_are_unauthorized() {
        let verdict = gate().validate(
            "SELECT * FROM read_csv('/etc/passwd')",
            "douyin_analytics",
        );
        assert!(matches!(
            verdict.reason(),
            Some(RejectionReason::UnauthorizedTable(name)) if name == "read_csv"
        ));
    }

    #[test]
    fn test_lateral_and_wrapped_table_functions_are_unauthorized() {
        let gate = gate();
        for (sql, function) in [
            (
                "SELECT * FROM douyin_products, LATERAL read_csv('/tmp/secret.csv')",
                "read_csv",
            ),
            ("SELECT * FROM TABLE(read_csv('/tmp/secret.csv'))", "read_csv"),
            (
                "SELECT * FROM douyin_products d JOIN LATERAL read_json_auto('/tmp/x.json') j ON true",
                "read_json_auto",
            ),
        ] {
            let verdict = gate.validate(sql, "douyin_analytics");
            assert_eq!(
                verdict.reason(),
                Some(&RejectionReason::UnauthorizedTable(function.into())),
                "{sql:?}"
            );
        }
    }

    #[test]
    fn test_select_into_in_subquery_reaches_tree_walk() {
        // no deny-listed keyword, so only the structural walk can catch it
        let sql = "SELECT * FROM (SELECT * INTO stash FROM douyin_products) t";
        assert!(keywords::classify(sql).is_ok());

        let verdict = gate().validate(sql, "douyin_analytics");
        assert!(matches!(
            verdict.reason(),
            Some(RejectionReason::ForbiddenOperation(detail)) if detail.contains("stash")
        ));
    }

    #[test]
    fn test_syntax_error_is_not_security() {
        let verdict = gate().validate("SELECT * FROM douyin_products WHERE", "douyin_analytics");
        let reason = verdict.reason().unwrap();
        assert_eq!(reason.code(), "syntax_error");
        assert!(!reason.is_security());
    }

    #[test]
    fn test_query_too_long() {
        let gate = gate().with_max_query_length(20);
        let verdict = gate.validate(
            "SELECT title, price FROM douyin_products",
            "douyin_analytics",
        );
        assert!(matches!(
            verdict.reason(),
            Some(RejectionReason::QueryTooLong { limit: 20, .. })
        ));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let gate = gate();
        for sql in [
            "SELECT category, sum(sales) FROM douyin_products GROUP BY category",
            "SELECT * FROM apps",
            "UPDATE douyin_products SET price = 0",
        ] {
            let first = gate.validate(sql, "douyin_analytics");
            let second = gate.validate(sql, "douyin_analytics");
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_keyword_only_mode_still_authorizes_tables() {
        let gate = SafetyGate::keyword_only(allow_list());
        assert!(!gate.structural_enabled());

        let ok = gate.validate(
            "SELECT * FROM douyin_products d JOIN sales_summary s ON d.id = s.id",
            "douyin_analytics",
        );
        assert!(ok.is_valid());
        assert!(!ok.structural_checked());

        let bad = gate.validate("SELECT * FROM apps", "douyin_analytics");
        assert!(matches!(
            bad.reason(),
            Some(RejectionReason::UnauthorizedTable(_))
        ));
    }

    #[test]
    fn test_from_config_unknown_dialect_degrades() {
        let config = SafetyConfig {
            dialect: "klingon".into(),
            ..SafetyConfig::default()
        };
        assert!(!SafetyGate::from_config(&config, allow_list()).structural_enabled());
        assert!(SafetyGate::from_config(&SafetyConfig::default(), allow_list()).structural_enabled());
    }

    #[test]
    fn test_approve_returns_rejection_with_candidate() {
        let gate = gate();
        let rejected = gate
            .approve(QueryCandidate::direct("SELECT * FROM apps", "douyin_analytics"))
            .unwrap_err();
        assert_eq!(rejected.candidate.sql(), "SELECT * FROM apps");
        assert!(!rejected.verdict.is_valid());

        let approved = gate
            .approve(QueryCandidate::direct(
                "SELECT * FROM category_analysis",
                "douyin_analytics",
            ))
            .unwrap();
        assert_eq!(approved.verdict().tables(), ["category_analysis"]);
    }
}
