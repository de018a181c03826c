use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a query candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    /// SQL submitted directly by a caller
    Direct,
    /// First SQL produced by the model for a question
    Generated,
    /// SQL produced by the repair loop
    Repair { attempt: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub question: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub origin: Origin,
}

/// A proposed SQL statement for one target database.
///
/// Candidates are immutable. A repair produces a new candidate through
/// [`QueryCandidate::repaired`] and leaves the original untouched.
#[derive(Debug, Clone, Serialize)]
pub struct QueryCandidate {
    sql: String,
    database: String,
    provenance: Provenance,
}

impl QueryCandidate {
    pub fn direct(sql: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            database: database.into(),
            provenance: Provenance {
                question: None,
                generated_at: Utc::now(),
                origin: Origin::Direct,
            },
        }
    }

    pub fn generated(
        question: impl Into<String>,
        database: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            sql: sql.into(),
            database: database.into(),
            provenance: Provenance {
                question: Some(question.into()),
                generated_at: Utc::now(),
                origin: Origin::Generated,
            },
        }
    }

    /// Builds the successor candidate for a repair attempt, keeping the
    /// database and the originating question.
    pub fn repaired(&self, sql: impl Into<String>, attempt: u32) -> Self {
        Self {
            sql: sql.into(),
            database: self.database.clone(),
            provenance: Provenance {
                question: self.provenance.question.clone(),
                generated_at: Utc::now(),
                origin: Origin::Repair { attempt },
            },
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn question(&self) -> Option<&str> {
        self.provenance.question.as_deref()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}

/// Why a query candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("SQL syntax error: {0}")]
    SyntaxError(String),
    #[error("forbidden keyword: {0}")]
    ForbiddenKeyword(String),
    #[error("no read-only query form: {0}")]
    MissingQueryForm(String),
    #[error("forbidden operation: {0}")]
    ForbiddenOperation(String),
    #[error("unauthorized table: {0}")]
    UnauthorizedTable(String),
    #[error("query is {length} characters long, the limit is {limit}")]
    QueryTooLong { length: usize, limit: usize },
    #[error("repair gave up after {attempts} attempt(s), last failure: {last}")]
    RepairExhausted {
        attempts: u32,
        last: Box<RejectionReason>,
    },
}

impl RejectionReason {
    /// Stable machine-readable code, matching the serialized tag.
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::SyntaxError(_) => "syntax_error",
            RejectionReason::ForbiddenKeyword(_) => "forbidden_keyword",
            RejectionReason::MissingQueryForm(_) => "missing_query_form",
            RejectionReason::ForbiddenOperation(_) => "forbidden_operation",
            RejectionReason::UnauthorizedTable(_) => "unauthorized_table",
            RejectionReason::QueryTooLong { .. } => "query_too_long",
            RejectionReason::RepairExhausted { .. } => "repair_exhausted",
        }
    }

    /// Malformed model output is not a security event; everything else is.
    pub fn is_security(&self) -> bool {
        match self {
            RejectionReason::SyntaxError(_) => false,
            RejectionReason::RepairExhausted { last, .. } => last.is_security(),
            _ => true,
        }
    }
}

/// Outcome of validating one query candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    valid: bool,
    reason: Option<RejectionReason>,
    suggestions: Vec<String>,
    tables: Vec<String>,
    structural_checked: bool,
}

impl Verdict {
    pub(crate) fn accept(tables: Vec<String>, structural_checked: bool) -> Self {
        Self {
            valid: true,
            reason: None,
            suggestions: Vec::new(),
            tables,
            structural_checked,
        }
    }

    pub(crate) fn reject(
        reason: RejectionReason,
        suggestions: Vec<String>,
        structural_checked: bool,
    ) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            suggestions,
            tables: Vec::new(),
            structural_checked,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn reason(&self) -> Option<&RejectionReason> {
        self.reason.as_ref()
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    /// Allow-listed tables the query reads, empty for rejected queries.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// False when the gate ran without a structural parser.
    pub fn structural_checked(&self) -> bool {
        self.structural_checked
    }
}

/// A candidate whose most recent verdict is valid.
///
/// Only [`SafetyGate::approve`](super::SafetyGate::approve) builds one, and it
/// is the only thing the executor accepts.
#[derive(Debug, Clone)]
pub struct ApprovedQuery {
    candidate: QueryCandidate,
    verdict: Verdict,
}

impl ApprovedQuery {
    pub(crate) fn new(candidate: QueryCandidate, verdict: Verdict) -> Self {
        debug_assert!(verdict.is_valid());
        Self { candidate, verdict }
    }

    pub fn sql(&self) -> &str {
        self.candidate.sql()
    }

    pub fn database(&self) -> &str {
        self.candidate.database()
    }

    pub fn candidate(&self) -> &QueryCandidate {
        &self.candidate
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }
}

/// A candidate that failed validation, returned with its verdict.
#[derive(Debug, Clone)]
pub struct Rejected {
    pub candidate: QueryCandidate,
    pub verdict: Verdict,
}

impl Rejected {
    pub fn reason(&self) -> RejectionReason {
        self.verdict
            .reason()
            .cloned()
            .unwrap_or_else(|| RejectionReason::MissingQueryForm("no reason recorded".to_string()))
    }
}
