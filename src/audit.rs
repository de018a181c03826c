//! Append-only query audit log, one JSON object per line.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::safety::RejectionReason;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One processed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Natural-language question, absent for raw SQL requests
    pub question: Option<String>,
    pub database: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Last SQL the gate saw for this request
    pub sql: String,
    pub success: bool,
    pub rejection: Option<RejectionReason>,
    /// Generation or execution failure outside the gate
    pub error: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub row_count: Option<usize>,
    pub auto_fixed: bool,
    pub repair_attempts: u32,
}

impl AuditRecord {
    pub fn new(question: Option<&str>, database: &str, sql: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            question: question.map(str::to_string),
            database: database.to_string(),
            user_id: None,
            session_id: None,
            sql: sql.to_string(),
            success: false,
            rejection: None,
            error: None,
            execution_time_ms: None,
            row_count: None,
            auto_fixed: false,
            repair_attempts: 0,
        }
    }

    pub fn with_caller(mut self, user_id: Option<&str>, session_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self.session_id = session_id.map(str::to_string);
        self
    }
}

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Opens `path` for appending, creating it and its parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!("Audit log at {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the record as a single line. Concurrent appends never interleave.
    pub async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// The last `limit` records, newest first. Lines that fail to parse are
    /// skipped.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditError> {
        let contents = {
            let _guard = self.file.lock().await;
            fs::read_to_string(&self.path).await?
        };

        let records = contents
            .lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping unreadable audit line: {}", e);
                    None
                }
            })
            .take(limit)
            .collect();
        Ok(records)
    }
}
