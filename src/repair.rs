//! Bounded repair loop for rejected query candidates.
//!
//! A rejected candidate is sent back to the text generator together with the
//! rejection reason and the allowed schema. Each answer becomes a new
//! candidate and goes through the full gate again. The loop stops on the
//! first valid candidate, after `max_attempts` tries, or when its deadline
//! passes. An invalid candidate never leaves the loop as approved.

use serde::Serialize;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use crate::llm::{TextGenerator, extract_sql, prompts};
use crate::safety::{ApprovedQuery, QueryCandidate, Rejected, RejectionReason, SafetyGate};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RepairState {
    Generated,
    Validating,
    Valid,
    Invalid,
    Repairing { attempt: u32 },
    Exhausted,
    TimedOut,
}

#[derive(Debug)]
pub enum RepairOutcome {
    Valid(ApprovedQuery),
    /// Every attempt was used up; carries the last rejected candidate.
    Exhausted(Rejected),
    /// The deadline passed during a repair; carries the last verdict reached.
    TimedOut(Rejected),
}

#[derive(Debug)]
pub struct RepairReport {
    pub outcome: RepairOutcome,
    /// Completed repair attempts, 0 when the first candidate was valid. An
    /// attempt abandoned at the deadline is not counted.
    pub attempts: u32,
    pub transitions: Vec<RepairState>,
}

impl RepairReport {
    /// True when the approved query came out of a repair attempt.
    pub fn repaired(&self) -> bool {
        matches!(self.outcome, RepairOutcome::Valid(_)) && self.attempts > 0
    }

    pub fn final_state(&self) -> Option<RepairState> {
        self.transitions.last().copied()
    }

    /// Collapses the report into the approved query or the rejection to
    /// surface. Exhaustion wraps the last reason in
    /// [`RejectionReason::RepairExhausted`].
    pub fn into_result(self) -> Result<ApprovedQuery, RejectionReason> {
        match self.outcome {
            RepairOutcome::Valid(approved) => Ok(approved),
            RepairOutcome::Exhausted(last) => Err(RejectionReason::RepairExhausted {
                attempts: self.attempts,
                last: Box::new(last.reason()),
            }),
            RepairOutcome::TimedOut(last) => Err(last.reason()),
        }
    }
}

pub struct RepairLoop<'a> {
    gate: &'a SafetyGate,
    generator: &'a dyn TextGenerator,
    max_attempts: u32,
    deadline: Option<Instant>,
}

impl<'a> RepairLoop<'a> {
    pub fn new(gate: &'a SafetyGate, generator: &'a dyn TextGenerator) -> Self {
        Self {
            gate,
            generator,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            deadline: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Validates a freshly generated candidate and repairs it if needed.
    pub async fn run(&self, candidate: QueryCandidate, schema: &str) -> RepairReport {
        let mut transitions = vec![RepairState::Generated, RepairState::Validating];
        match self.gate.approve(candidate) {
            Ok(approved) => {
                transitions.push(RepairState::Valid);
                RepairReport {
                    outcome: RepairOutcome::Valid(approved),
                    attempts: 0,
                    transitions,
                }
            }
            Err(rejected) => {
                transitions.push(RepairState::Invalid);
                self.repair_from(rejected, schema, transitions).await
            }
        }
    }

    /// Repairs a candidate the gate has already rejected.
    pub async fn repair(&self, rejected: Rejected, schema: &str) -> RepairReport {
        self.repair_from(rejected, schema, vec![RepairState::Invalid])
            .await
    }

    async fn repair_from(
        &self,
        mut last: Rejected,
        schema: &str,
        mut transitions: Vec<RepairState>,
    ) -> RepairReport {
        for attempt in 1..=self.max_attempts {
            transitions.push(RepairState::Repairing { attempt });
            info!(
                "Repair attempt {}/{} for {} ({})",
                attempt,
                self.max_attempts,
                last.candidate.database(),
                last.reason().code()
            );

            let prompt = prompts::repair_prompt(
                last.candidate.sql(),
                &last.reason(),
                last.verdict.suggestions(),
                schema,
            );

            let response = match self.deadline {
                Some(deadline) => match timeout_at(deadline, self.generator.generate(&prompt)).await {
                    Ok(response) => response,
                    Err(_) => {
                        warn!("Repair deadline passed during attempt {}", attempt);
                        transitions.push(RepairState::TimedOut);
                        return RepairReport {
                            outcome: RepairOutcome::TimedOut(last),
                            attempts: attempt - 1,
                            transitions,
                        };
                    }
                },
                None => self.generator.generate(&prompt).await,
            };

            let sql = match response {
                Ok(text) => extract_sql(&text),
                Err(e) => {
                    warn!("Generator failed on repair attempt {}: {}", attempt, e);
                    transitions.push(RepairState::Invalid);
                    continue;
                }
            };

            transitions.push(RepairState::Validating);
            let candidate = last.candidate.repaired(sql, attempt);
            match self.gate.approve(candidate) {
                Ok(approved) => {
                    info!("Repair attempt {} produced a valid query", attempt);
                    transitions.push(RepairState::Valid);
                    return RepairReport {
                        outcome: RepairOutcome::Valid(approved),
                        attempts: attempt,
                        transitions,
                    };
                }
                Err(rejected) => {
                    transitions.push(RepairState::Invalid);
                    last = rejected;
                }
            }
        }

        warn!(
            "Repair gave up after {} attempt(s): {}",
            self.max_attempts,
            last.reason()
        );
        transitions.push(RepairState::Exhausted);
        RepairReport {
            outcome: RepairOutcome::Exhausted(last),
            attempts: self.max_attempts,
            transitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::safety::{SqlParserAnalyzer, TableAllowList, TablePolicy};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Replays canned responses and records every prompt it receives.
    #[derive(Default)]
    struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("SELECT * FROM still_wrong".to_string()))
        }
    }

    struct SlowGenerator;

    #[async_trait]
    impl TextGenerator for SlowGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("SELECT * FROM douyin_products".to_string())
        }
    }

    /// Answers the first prompt with bad SQL, then stalls.
    #[derive(Default)]
    struct StallingGenerator {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl TextGenerator for StallingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call > 1 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok("SELECT * FROM orders".to_string())
        }
    }

    fn gate() -> SafetyGate {
        let allow_list = TableAllowList::new()
            .with_table("douyin_analytics", TablePolicy::read_only("douyin_products"))
            .with_table("douyin_analytics", TablePolicy::read_only("sales_summary"));
        SafetyGate::new(
            Arc::new(allow_list),
            Box::new(SqlParserAnalyzer::new("duckdb").unwrap()),
        )
    }

    fn candidate(sql: &str) -> QueryCandidate {
        QueryCandidate::generated("best sellers", "douyin_analytics", sql)
    }

    #[tokio::test]
    async fn test_valid_candidate_skips_repair() {
        let gate = gate();
        let generator = ScriptedGenerator::default();
        let report = RepairLoop::new(&gate, &generator)
            .run(candidate("SELECT * FROM douyin_products LIMIT 10"), "")
            .await;

        assert!(matches!(report.outcome, RepairOutcome::Valid(_)));
        assert_eq!(report.attempts, 0);
        assert!(!report.repaired());
        assert_eq!(generator.calls(), 0);
        assert_eq!(
            report.transitions,
            vec![RepairState::Generated, RepairState::Validating, RepairState::Valid]
        );
    }

    #[tokio::test]
    async fn test_repair_succeeds_on_second_attempt() {
        let gate = gate();
        let generator = ScriptedGenerator::new(vec![
            Ok("```sql\nSELECT * FROM orders\n```".to_string()),
            Ok("```sql\nSELECT title FROM douyin_products LIMIT 5;\n```".to_string()),
        ]);
        let report = RepairLoop::new(&gate, &generator)
            .run(candidate("SELECT * FROM users"), "douyin_products: title(VARCHAR)")
            .await;

        assert!(report.repaired());
        assert_eq!(report.attempts, 2);
        let approved = report.into_result().unwrap();
        assert_eq!(approved.sql(), "SELECT title FROM douyin_products LIMIT 5");
        assert_eq!(approved.candidate().question(), Some("best sellers"));

        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("SELECT * FROM users"));
        assert!(prompts[0].contains("unauthorized table: users"));
        assert!(prompts[1].contains("SELECT * FROM orders"));
    }

    #[tokio::test]
    async fn test_exhausts_after_three_attempts() {
        let gate = gate();
        let generator = ScriptedGenerator::new(vec![
            Ok("DROP TABLE douyin_products".to_string()),
            Ok("SELECT * FROM users".to_string()),
            Ok("SELECT * FROM sales_summary WHERE".to_string()),
            Ok("SELECT * FROM douyin_products".to_string()),
        ]);
        let report = RepairLoop::new(&gate, &generator)
            .run(candidate("SELECT * FROM users"), "")
            .await;

        assert_eq!(report.attempts, 3);
        assert_eq!(generator.calls(), 3);
        assert_eq!(report.final_state(), Some(RepairState::Exhausted));
        match report.into_result() {
            Err(RejectionReason::RepairExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, RejectionReason::SyntaxError(_)));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generator_errors_count_as_attempts() {
        let gate = gate();
        let generator = ScriptedGenerator::new(vec![
            Err(LlmError::ConnectionError("refused".into())),
            Err(LlmError::ResponseError("bad gateway".into())),
        ]);
        let report = RepairLoop::new(&gate, &generator)
            .with_max_attempts(2)
            .run(candidate("SELECT * FROM users"), "")
            .await;

        assert_eq!(report.attempts, 2);
        match report.outcome {
            RepairOutcome::Exhausted(last) => {
                assert_eq!(last.candidate.sql(), "SELECT * FROM users");
                assert_eq!(last.reason(), RejectionReason::UnauthorizedTable("users".into()));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_model_output_is_rejected() {
        let gate = gate();
        let generator = ScriptedGenerator::new(vec![Ok("Sorry, I can't help.".to_string())]);
        let report = RepairLoop::new(&gate, &generator)
            .with_max_attempts(1)
            .run(candidate("SELECT * FROM users"), "")
            .await;

        match report.outcome {
            RepairOutcome::Exhausted(last) => {
                assert!(matches!(last.reason(), RejectionReason::MissingQueryForm(_)));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_surfaces_last_verdict() {
        let gate = gate();
        let generator = SlowGenerator;
        let report = RepairLoop::new(&gate, &generator)
            .with_deadline(Instant::now() + Duration::from_millis(50))
            .run(candidate("SELECT * FROM users"), "")
            .await;

        assert_eq!(report.final_state(), Some(RepairState::TimedOut));
        assert_eq!(report.attempts, 0);
        match report.outcome {
            RepairOutcome::TimedOut(last) => {
                assert_eq!(last.reason(), RejectionReason::UnauthorizedTable("users".into()));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_counts_only_completed_attempts() {
        let gate = gate();
        let generator = StallingGenerator::default();
        let report = RepairLoop::new(&gate, &generator)
            .with_deadline(Instant::now() + Duration::from_millis(200))
            .run(candidate("SELECT * FROM users"), "")
            .await;

        assert_eq!(report.attempts, 1);
        match report.outcome {
            RepairOutcome::TimedOut(last) => {
                assert_eq!(last.reason(), RejectionReason::UnauthorizedTable("orders".into()));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repair_of_already_rejected_candidate() {
        let gate = gate();
        let rejected = gate
            .approve(QueryCandidate::direct("SELECT * FROM users", "douyin_analytics"))
            .unwrap_err();
        let generator = ScriptedGenerator::new(vec![Ok("SELECT * FROM sales_summary".to_string())]);

        let report = RepairLoop::new(&gate, &generator).repair(rejected, "").await;
        assert_eq!(
            report.transitions,
            vec![
                RepairState::Invalid,
                RepairState::Repairing { attempt: 1 },
                RepairState::Validating,
                RepairState::Valid,
            ]
        );
    }
}
