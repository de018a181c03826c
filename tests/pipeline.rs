mod common;

use common::{DATABASE, ScriptedGenerator, harness};
use nl_sqlgate::llm::LlmError;
use nl_sqlgate::pipeline::PipelineError;
use nl_sqlgate::safety::RejectionReason;

#[tokio::test]
async fn test_valid_question_is_executed_and_audited() {
    let h = harness(ScriptedGenerator::answering(&[
        "SELECT title, sales FROM douyin_products ORDER BY sales DESC LIMIT 2;",
    ]))
    .await;

    let result = h.pipeline.run("top two products by sales", DATABASE).await.unwrap();
    assert_eq!(result.output.row_count, 2);
    assert_eq!(result.output.columns, vec!["title", "sales"]);
    assert!(!result.repaired);
    assert_eq!(result.verdict.tables(), ["douyin_products"]);

    let prompt = &h.generator.prompts()[0];
    assert!(prompt.contains("top two products by sales"));
    assert!(prompt.contains("title(VARCHAR)"));
    assert!(!prompt.contains("internal_costs"));

    let records = h.audit.recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].row_count, Some(2));
    assert_eq!(records[0].question.as_deref(), Some("top two products by sales"));
    assert!(!records[0].auto_fixed);
}

#[tokio::test]
async fn test_rejected_generation_is_repaired() {
    let h = harness(ScriptedGenerator::answering(&[
        "SELECT p.title, c.cost FROM douyin_products p JOIN internal_costs c ON p.id = c.product_id",
        "SELECT title, price FROM douyin_products WHERE category = 'beauty'",
    ]))
    .await;

    let result = h.pipeline.run("beauty product margins", DATABASE).await.unwrap();
    assert!(result.repaired);
    assert_eq!(result.repair_attempts, 1);
    assert_eq!(result.output.row_count, 2);

    let prompts = h.generator.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("unauthorized table: internal_costs"));

    let record = &h.audit.recent(1).await.unwrap()[0];
    assert!(record.success);
    assert!(record.auto_fixed);
    assert_eq!(record.repair_attempts, 1);
    assert!(record.sql.contains("category = 'beauty'"));
}

#[tokio::test]
async fn test_repair_gives_up_after_three_attempts() {
    let h = harness(ScriptedGenerator::answering(&[
        "DROP TABLE douyin_products",
        "DELETE FROM douyin_products",
        "SELECT * FROM internal_costs",
        "UPDATE douyin_products SET price = 0",
        "SELECT * FROM douyin_products",
    ]))
    .await;

    match h.pipeline.run("wipe everything", DATABASE).await {
        Err(PipelineError::Rejected { verdict, attempts, .. }) => {
            assert_eq!(attempts, 3);
            match verdict.reason() {
                Some(RejectionReason::RepairExhausted { attempts, last }) => {
                    assert_eq!(*attempts, 3);
                    assert_eq!(**last, RejectionReason::ForbiddenKeyword("UPDATE".into()));
                }
                other => panic!("expected exhaustion, got {other:?}"),
            }
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    // one generation plus three repairs, the fifth answer is never requested
    assert_eq!(h.generator.prompts().len(), 4);

    let record = &h.audit.recent(1).await.unwrap()[0];
    assert!(!record.success);
    assert_eq!(record.rejection.as_ref().map(|r| r.code()), Some("repair_exhausted"));
    assert_eq!(record.row_count, None);

    // the table is untouched
    let check = h
        .pipeline
        .execute_direct("SELECT count(*) AS n FROM douyin_products", DATABASE)
        .await
        .unwrap();
    assert_eq!(check.output.row_count, 1);
}

#[tokio::test]
async fn test_generation_failure_is_reported_and_audited() {
    let h = harness(ScriptedGenerator::new(vec![Err(LlmError::ConnectionError(
        "connection refused".into(),
    ))]))
    .await;

    assert!(matches!(
        h.pipeline.run("anything", DATABASE).await,
        Err(PipelineError::Generation(_))
    ));
    let record = &h.audit.recent(1).await.unwrap()[0];
    assert!(record.error.as_deref().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_unknown_database_skips_generation() {
    let h = harness(ScriptedGenerator::default()).await;
    assert!(matches!(
        h.pipeline.run("list apps", "dify_system").await,
        Err(PipelineError::UnknownDatabase(_))
    ));
    assert!(h.generator.prompts().is_empty());
}

#[tokio::test]
async fn test_direct_sql_cannot_read_files_through_table_functions() {
    let h = harness(ScriptedGenerator::default()).await;
    let secret = h.dir.path().join("secret.csv");
    std::fs::write(&secret, "secret\nhunter2\n").unwrap();

    for sql in [
        format!(
            "SELECT * FROM douyin_products, LATERAL read_csv('{}')",
            secret.display()
        ),
        format!("SELECT * FROM TABLE(read_csv('{}'))", secret.display()),
    ] {
        match h.pipeline.execute_direct(&sql, DATABASE).await {
            Err(PipelineError::Rejected { verdict, .. }) => assert_eq!(
                verdict.reason(),
                Some(&RejectionReason::UnauthorizedTable("read_csv".into()))
            ),
            other => panic!("expected rejection for {sql:?}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_trailing_comment_survives_row_limit() {
    let h = harness(ScriptedGenerator::default()).await;

    let result = h
        .pipeline
        .execute_direct("SELECT title FROM douyin_products -- best sellers", DATABASE)
        .await
        .unwrap();
    assert_eq!(result.output.row_count, 4);
    assert_eq!(result.output.columns, vec!["title"]);
}

#[tokio::test]
async fn test_direct_sql_is_never_repaired() {
    let h = harness(ScriptedGenerator::default()).await;

    match h
        .pipeline
        .execute_direct("SELECT * FROM douyin_products; DROP TABLE sales_summary", DATABASE)
        .await
    {
        Err(PipelineError::Rejected { verdict, attempts, .. }) => {
            assert_eq!(attempts, 0);
            assert_eq!(
                verdict.reason(),
                Some(&RejectionReason::ForbiddenKeyword("DROP".into()))
            );
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(h.generator.prompts().is_empty());

    let ok = h
        .pipeline
        .execute_direct(
            "WITH beauty AS (SELECT * FROM douyin_products WHERE category = 'beauty') \
             SELECT b.title, s.total FROM beauty b JOIN sales_summary s ON b.id = s.product_id",
            DATABASE,
        )
        .await
        .unwrap();
    assert_eq!(ok.output.row_count, 2);
    assert_eq!(ok.output.row_limit, 1_000);
    assert_eq!(h.audit.recent(10).await.unwrap().len(), 2);
}
