//! Keyword screen over raw SQL text.
//!
//! Runs before any parsing and sees everything in the text, comments and
//! string literals included. A comment that only mentions a forbidden word is
//! still rejected.

use std::sync::LazyLock;

use regex::Regex;

use super::verdict::RejectionReason;

/// Mutating, DDL and administrative keywords. Multi-word entries match
/// consecutive tokens and come before their single-word prefixes so the
/// reported keyword is the most specific one.
pub const DENIED_KEYWORDS: &[&str] = &[
    // users and permissions
    "CREATE USER",
    "DROP USER",
    "ALTER USER",
    "GRANT",
    "REVOKE",
    // structure
    "ADD COLUMN",
    "DROP COLUMN",
    "CREATE",
    "ALTER",
    "DROP",
    "RENAME",
    // data
    "INSERT",
    "UPDATE",
    "DELETE",
    "TRUNCATE",
    "MERGE",
    "UPSERT",
    "COPY",
    // procedures
    "EXEC",
    "EXECUTE",
    "CALL",
    "PROCEDURE",
    "FUNCTION",
    // system
    "BACKUP",
    "RESTORE",
    "IMPORT",
    "EXPORT",
    "SHUTDOWN",
    "KILL",
    "LOCK",
    "UNLOCK",
    // duckdb administration
    "ATTACH",
    "DETACH",
    "INSTALL",
    "LOAD",
    "PRAGMA",
    "VACUUM",
];

/// At least one of these must appear for the text to be a query.
pub const QUERY_KEYWORDS: &[&str] = &["SELECT", "WITH"];

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("token pattern compiles"));

/// Upper-cased identifier-like tokens in order of appearance.
fn tokens(sql: &str) -> Vec<String> {
    TOKEN
        .find_iter(sql)
        .map(|m| m.as_str().to_ascii_uppercase())
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let words: Vec<&str> = phrase.split_whitespace().collect();
    if words.is_empty() || words.len() > tokens.len() {
        return false;
    }
    tokens
        .windows(words.len())
        .any(|window| window.iter().zip(&words).all(|(t, w)| t == w))
}

/// Returns the first deny-listed keyword found in `sql`, if any.
pub fn find_denied_keyword(sql: &str) -> Option<&'static str> {
    let tokens = tokens(sql);
    DENIED_KEYWORDS
        .iter()
        .copied()
        .find(|keyword| contains_phrase(&tokens, keyword))
}

/// Pass/fail keyword classification.
pub fn classify(sql: &str) -> Result<(), RejectionReason> {
    if let Some(keyword) = find_denied_keyword(sql) {
        return Err(RejectionReason::ForbiddenKeyword(keyword.to_string()));
    }

    let tokens = tokens(sql);
    if !QUERY_KEYWORDS
        .iter()
        .any(|keyword| tokens.iter().any(|t| t == keyword))
    {
        return Err(RejectionReason::MissingQueryForm(
            "query must contain SELECT or WITH".to_string(),
        ));
    }

    Ok(())
}
