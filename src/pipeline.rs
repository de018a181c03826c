//! Question in, rows out.
//!
//! Generates SQL for a question, runs it through the safety gate and the
//! repair loop, executes the approved query and writes one audit record per
//! request, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info};

use crate::audit::{AuditLog, AuditRecord};
use crate::db::executor::{ExecutionError, QueryExecutor, QueryOutput};
use crate::db::schema_manager::SchemaManager;
use crate::llm::{LlmError, TextGenerator, extract_sql, prompts};
use crate::repair::{DEFAULT_MAX_ATTEMPTS, RepairLoop, RepairOutcome};
use crate::safety::{QueryCandidate, RejectionReason, SafetyGate, Verdict};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown database '{0}'")]
    UnknownDatabase(String),
    #[error("SQL generation failed: {0}")]
    Generation(#[from] LlmError),
    #[error("query rejected after {attempts} repair attempt(s): {sql}")]
    Rejected {
        sql: String,
        verdict: Verdict,
        attempts: u32,
    },
    #[error("request timed out")]
    TimedOut { last: Option<Verdict> },
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Who asked, as far as the audit log is concerned.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Caller {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug)]
pub struct PipelineResult {
    /// The approved SQL, before the row-limit wrapper
    pub sql: String,
    pub verdict: Verdict,
    pub output: QueryOutput,
    pub repaired: bool,
    pub repair_attempts: u32,
}

pub struct NlQueryPipeline {
    gate: Arc<SafetyGate>,
    generator: Arc<dyn TextGenerator>,
    executor: Arc<QueryExecutor>,
    schema: Arc<SchemaManager>,
    audit: Option<Arc<AuditLog>>,
    max_repair_attempts: u32,
    request_timeout: Duration,
}

impl NlQueryPipeline {
    pub fn new(
        gate: Arc<SafetyGate>,
        generator: Arc<dyn TextGenerator>,
        executor: Arc<QueryExecutor>,
        schema: Arc<SchemaManager>,
    ) -> Self {
        Self {
            gate,
            generator,
            executor,
            schema,
            audit: None,
            max_repair_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_max_repair_attempts(mut self, attempts: u32) -> Self {
        self.max_repair_attempts = attempts;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn schema(&self) -> &SchemaManager {
        &self.schema
    }

    /// Answers `question` against `database`.
    pub async fn run(&self, question: &str, database: &str) -> Result<PipelineResult, PipelineError> {
        self.run_for(question, database, &Caller::default()).await
    }

    pub async fn run_for(
        &self,
        question: &str,
        database: &str,
        caller: &Caller,
    ) -> Result<PipelineResult, PipelineError> {
        info!("NL query on {}: {}", database, question);
        let mut record = audit_record(Some(question), database, "", caller);
        let result = self.answer(question, database, &mut record).await;
        self.finish(record, &result).await;
        result
    }

    /// Validates and executes caller-supplied SQL. Rejections are final; raw
    /// SQL is never sent for repair.
    pub async fn execute_direct(&self, sql: &str, database: &str) -> Result<PipelineResult, PipelineError> {
        self.execute_direct_for(sql, database, &Caller::default()).await
    }

    pub async fn execute_direct_for(
        &self,
        sql: &str,
        database: &str,
        caller: &Caller,
    ) -> Result<PipelineResult, PipelineError> {
        let record = audit_record(None, database, sql, caller);
        let deadline = Instant::now() + self.request_timeout;

        let result = match self.gate.approve(QueryCandidate::direct(sql, database)) {
            Ok(approved) => match timeout_at(deadline, self.executor.execute(&approved)).await {
                Ok(Ok(output)) => Ok(PipelineResult {
                    sql: approved.sql().to_string(),
                    verdict: approved.verdict().clone(),
                    output,
                    repaired: false,
                    repair_attempts: 0,
                }),
                Ok(Err(e)) => Err(PipelineError::Execution(e)),
                Err(_) => Err(PipelineError::TimedOut {
                    last: Some(approved.verdict().clone()),
                }),
            },
            Err(rejected) => Err(PipelineError::Rejected {
                sql: sql.to_string(),
                verdict: rejected.verdict,
                attempts: 0,
            }),
        };

        self.finish(record, &result).await;
        result
    }

    async fn answer(
        &self,
        question: &str,
        database: &str,
        record: &mut AuditRecord,
    ) -> Result<PipelineResult, PipelineError> {
        if self.gate.allow_list().database(database).is_none() {
            return Err(PipelineError::UnknownDatabase(database.to_string()));
        }
        let deadline = Instant::now() + self.request_timeout;

        let schema = self.schema.context_for(database).await;
        let prompt = prompts::generation_prompt(question, database, &schema);
        let response = timeout_at(deadline, self.generator.generate(&prompt))
            .await
            .map_err(|_| PipelineError::TimedOut { last: None })??;
        let sql = extract_sql(&response);
        record.sql = sql.clone();

        let report = RepairLoop::new(&self.gate, self.generator.as_ref())
            .with_max_attempts(self.max_repair_attempts)
            .with_deadline(deadline)
            .run(QueryCandidate::generated(question, database, sql), &schema)
            .await;
        let attempts = report.attempts;
        record.repair_attempts = attempts;

        let approved = match report.outcome {
            RepairOutcome::Valid(approved) => approved,
            RepairOutcome::Exhausted(last) => {
                record.sql = last.candidate.sql().to_string();
                let verdict = if attempts == 0 {
                    last.verdict
                } else {
                    Verdict::reject(
                        RejectionReason::RepairExhausted {
                            attempts,
                            last: Box::new(last.reason()),
                        },
                        last.verdict.suggestions().to_vec(),
                        last.verdict.structural_checked(),
                    )
                };
                return Err(PipelineError::Rejected {
                    sql: last.candidate.sql().to_string(),
                    verdict,
                    attempts,
                });
            }
            RepairOutcome::TimedOut(last) => {
                record.sql = last.candidate.sql().to_string();
                return Err(PipelineError::TimedOut {
                    last: Some(last.verdict),
                });
            }
        };

        record.sql = approved.sql().to_string();
        record.auto_fixed = attempts > 0;

        let output = timeout_at(deadline, self.executor.execute(&approved))
            .await
            .map_err(|_| PipelineError::TimedOut {
                last: Some(approved.verdict().clone()),
            })??;

        Ok(PipelineResult {
            sql: approved.sql().to_string(),
            verdict: approved.verdict().clone(),
            output,
            repaired: attempts > 0,
            repair_attempts: attempts,
        })
    }

    async fn finish(&self, mut record: AuditRecord, result: &Result<PipelineResult, PipelineError>) {
        match result {
            Ok(result) => {
                record.success = true;
                record.execution_time_ms = Some(result.output.execution_time_ms);
                record.row_count = Some(result.output.row_count);
            }
            Err(PipelineError::Rejected { verdict, .. }) => {
                record.rejection = verdict.reason().cloned();
            }
            Err(PipelineError::TimedOut { last }) => {
                record.error = Some("request timed out".to_string());
                record.rejection = last.as_ref().and_then(|v| v.reason().cloned());
            }
            Err(e) => record.error = Some(e.to_string()),
        }

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(&record).await {
                error!("Failed to write audit record {}: {}", record.id, e);
            }
        }
    }
}

fn audit_record(question: Option<&str>, database: &str, sql: &str, caller: &Caller) -> AuditRecord {
    AuditRecord::new(question, database, sql)
        .with_caller(caller.user_id.as_deref(), caller.session_id.as_deref())
}
