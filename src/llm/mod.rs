pub mod prompts;
pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    ConnectionError(String),
    #[error("LLM response error: {0}")]
    ResponseError(String),
    #[error("LLM configuration error: {0}")]
    ConfigError(String),
}

/// Text-generation collaborator: turns a prompt into model output.
///
/// The repair loop and the pipeline only see this trait, so tests can script
/// the model's answers.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Owns the configured provider.
#[derive(Clone)]
pub struct LlmManager {
    backend: String,
    generator: Arc<dyn TextGenerator>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let generator: Arc<dyn TextGenerator> = match config.backend.as_str() {
            "remote" => Arc::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Arc::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )));
            }
        };

        Ok(Self {
            backend: config.backend.clone(),
            generator,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn generator(&self) -> Arc<dyn TextGenerator> {
        self.generator.clone()
    }
}

#[async_trait]
impl TextGenerator for LlmManager {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.generator.generate(prompt).await
    }
}

/// Pulls the SQL statement out of a model response.
///
/// Tries a ```sql fence, then a bare fence, then the first line that starts
/// like a statement. Returns an empty string when nothing looks like SQL.
pub fn extract_sql(content: &str) -> String {
    if let Some(start) = content.find("```sql") {
        let after = &content[start + 6..];
        let sql = after.find("```").map_or(after, |end| &after[..end]);
        debug!("Extracted SQL from sql code block");
        return clean(sql);
    }

    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            debug!("Extracted SQL from plain code block");
            return clean(&after[..end]);
        }
    }

    // Mutating keywords are included so the gate sees, and rejects, what the
    // model actually wrote.
    let statement_starts = [
        "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP",
    ];
    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let upper = line.trim().to_uppercase();
        if !statement_starts.iter().any(|kw| upper.starts_with(kw)) {
            continue;
        }

        let mut sql = line.trim().to_string();
        if !sql.ends_with(';') {
            for next in &lines[i + 1..] {
                let next = next.trim();
                if next.starts_with("```") || next.is_empty() {
                    break;
                }
                sql.push(' ');
                sql.push_str(next);
                if next.ends_with(';') {
                    break;
                }
            }
        }
        info!("Extracted SQL using line scanning");
        return clean(&sql);
    }

    warn!("No SQL found in model response");
    String::new()
}

/// Trims whitespace and one trailing semicolon.
fn clean(sql: &str) -> String {
    let sql = sql.trim();
    sql.strip_suffix(';').unwrap_or(sql).trim_end().to_string()
}
