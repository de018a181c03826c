//! Prompt builders for SQL generation and repair.

use crate::safety::RejectionReason;

/// Prompt asking the model to answer `question` with one read-only query
/// against the tables described in `schema`.
pub fn generation_prompt(question: &str, database: &str, schema: &str) -> String {
    format!(
        r#"
### Instructions:
Your task is to convert a question into a single read-only SQL query for DuckDB, given a database schema.
Adhere to these rules:
- **Only use the tables and columns listed below**
- **Use the exact spelling of column names as provided in the schema**
- **Use Table Aliases** to prevent ambiguity. For example, `SELECT p.title, s.total FROM douyin_products p JOIN sales_summary s ON p.id = s.product_id`.
- Write exactly one SELECT statement (a WITH clause is fine); never modify data
- Add a LIMIT so the result stays small
- When creating a ratio, always cast the numerator as float

### Input:
Generate a SQL query that answers the question `{question}`.
This query will run on the `{database}` database with the following tables and columns:

{schema}

### Response:
Return only the SQL inside a code block.
```sql
"#
    )
}

/// Prompt asking the model to fix `sql` after the gate rejected it.
pub fn repair_prompt(sql: &str, reason: &RejectionReason, suggestions: &[String], schema: &str) -> String {
    let hints = if suggestions.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = suggestions.iter().map(|s| format!("- {s}")).collect();
        format!("\nHints:\n{}\n", lines.join("\n"))
    };

    format!(
        r#"
### Instructions:
The SQL query below was rejected. Fix it so that it:
- is syntactically valid DuckDB SQL
- only reads the tables and columns listed below
- is a single read-only SELECT statement

### Rejected SQL:
{sql}

### Error:
{reason}
{hints}
### Available tables:
{schema}

### Response:
Return only the corrected SQL inside a code block.
```sql
"#
    )
}
